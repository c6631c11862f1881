// Container engine abstraction
//
// Everything the sandbox needs from the container engine. `DockerEngine` is
// the production implementation; tests plug in an in-memory engine.

use super::error::Result;
use super::types::Ulimit;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Duplex socket bound to a container's stdin/stdout/stderr.
pub trait AttachStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AttachStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Named volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub volume: String,
    pub target: String,
}

/// Engine-level container creation parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `None` runs the image's own command.
    pub command: Option<Vec<String>>,
    pub user: String,
    pub working_dir: String,
    pub read_only: bool,
    pub network_disabled: bool,
    /// Memory ceiling in bytes; also used as memory+swap ceiling.
    pub memory: Option<i64>,
    pub pids_limit: Option<i64>,
    pub ulimits: Option<Vec<Ulimit>>,
    pub volume: Option<VolumeBinding>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Recorded container state as reported by inspect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// RFC 3339 timestamps as reported by the engine.
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub oom_killed: Option<bool>,
    /// Cluster node name; `None` on a single engine.
    pub node: Option<String>,
}

/// Container engine operations used by the sandbox lifecycle.
///
/// Every failure, transport or engine-reported, comes back as
/// `SandboxError::Engine` carrying the original message.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove a container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Attach to stdin, stdout and stderr of a container, streaming only new
    /// output. The returned socket carries the raw multiplexed frames.
    async fn attach(&self, id: &str) -> Result<Box<dyn AttachStream>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Extract a tar archive into `path` inside the container.
    async fn upload_archive(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<()>;
}
