//! # dockjail - untrusted code in throwaway containers
//!
//! dockjail runs attacker-supplied programs inside short-lived Docker
//! containers with CPU, wall-clock, memory, process and file-size limits, and
//! hands back the captured output, the exit status and whether a limit was hit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dockjail::config::Config;
//! use dockjail::sandbox::{CreateOptions, SandboxManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::default());
//!     let manager = SandboxManager::from_config(config)?;
//!
//!     let result = manager
//!         .run("python", CreateOptions::command("python3 -c 'print(42)'"), None)
//!         .await?;
//!     println!("exit={:?} stdout={:?}", result.exit_code, result.stdout);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`sandbox`] - stream codec, I/O pump, limits, outcome interpretation and
//!   the sandbox lifecycle manager
//! - [`config`] - configuration loading and validation
//! - [`logging`] - tracing subscriber setup
//! - [`cli`] - command-line entry points
//!
//! ## Limits
//!
//! A run is bounded by:
//!
//! - CPU time, enforced by the kernel through an `RLIMIT_CPU` ulimit
//! - wall-clock time, enforced by the attach stream pump
//! - memory, enforced by the engine's memory ceiling (reported as `oom_killed`)
//! - process count, enforced by the engine's pids ceiling
//! - file size, enforced by an `RLIMIT_FSIZE` ulimit

pub mod cli;
pub mod config;
pub mod logging;
pub mod sandbox;
