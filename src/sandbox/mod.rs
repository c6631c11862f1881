// Container sandbox module
//
// Runs untrusted programs in throwaway engine containers: the attach stream
// codec and pump, limit translation, outcome interpretation and the lifecycle
// manager that ties them together.

pub mod types;
pub mod error;
pub mod stream;
pub mod pump;
pub mod limits;
pub mod outcome;
pub mod truncation;
pub mod engine;
pub mod docker;
pub mod registry;
pub mod profile;
pub mod manager;

// Re-export commonly used types
pub use error::{SandboxError, PumpError, ConfigError, Result, ErrorReport, ErrorSeverity};
pub use types::*;
pub use stream::{demultiplex, FrameDecoder};
pub use pump::StreamPump;
pub use limits::{merge_limits, create_ulimits};
pub use outcome::{inspect_exited, is_killed_by_signal, Outcome};
pub use engine::{AttachStream, ContainerEngine, ContainerSpec, ContainerState, VolumeBinding};
pub use docker::DockerEngine;
pub use registry::{EngineRegistry, RetryPolicy};
pub use profile::ProfileRegistry;
pub use manager::{CreateOptions, Sandbox, SandboxManager};
