// Core data structures for the container sandbox

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Resource limits for one sandbox.
///
/// Used both for partial caller overrides (unset fields inherit defaults) and
/// for the fully merged set. A negative `processes` value means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// CPU time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cputime: Option<u64>,
    /// Wall-clock time in seconds for one start() call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime: Option<u64>,
    /// Memory ceiling in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    /// Maximum number of processes; negative for unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<i64>,
    /// Maximum size of a written file in KB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl Limits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cputime(mut self, seconds: u64) -> Self {
        self.cputime = Some(seconds);
        self
    }

    pub fn with_realtime(mut self, seconds: u64) -> Self {
        self.realtime = Some(seconds);
        self
    }

    pub fn with_memory(mut self, megabytes: u64) -> Self {
        self.memory = Some(megabytes);
        self
    }

    pub fn with_processes(mut self, count: i64) -> Self {
        self.processes = Some(count);
        self
    }

    /// Explicitly lift the process cap, overriding any default.
    pub fn with_unlimited_processes(mut self) -> Self {
        self.processes = Some(-1);
        self
    }

    pub fn with_file_size(mut self, kilobytes: u64) -> Self {
        self.file_size = Some(kilobytes);
        self
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self == &Limits::default()
    }
}

/// Process-wide default limits.
pub fn default_limits() -> Limits {
    Limits {
        cputime: Some(1),
        realtime: Some(5),
        memory: Some(64),
        processes: Some(-1),
        file_size: None,
    }
}

/// A named container recipe: what image to run, as whom, and with what
/// filesystem and network restrictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub docker_image: String,
    /// Shell command used when the caller does not supply one.
    #[serde(default)]
    pub command: Option<String>,
    /// Run-as user; falls back to the configured default user.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_network_disabled")]
    pub network_disabled: bool,
    /// Per-profile overlay on the process-wide default limits.
    #[serde(default)]
    pub limits: Option<Limits>,
}

fn default_network_disabled() -> bool {
    true
}

impl Profile {
    pub fn new(name: impl Into<String>, docker_image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docker_image: docker_image.into(),
            command: None,
            user: None,
            read_only: false,
            network_disabled: true,
            limits: None,
        }
    }
}

/// A file to place in the sandbox working directory before the first start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: Option<String>,
    pub content: Vec<u8>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// Names of the entries that carry one, in order.
pub fn filter_filenames(files: &[FileEntry]) -> Vec<&str> {
    files.iter().filter_map(|f| f.name.as_deref()).collect()
}

/// Engine ulimit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    pub fn new(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            soft: value,
            hard: value,
        }
    }
}

/// Handle to a scratch volume that can be shared between several runs.
///
/// Clones share the same volume and node. The node is filled in the first
/// time a container bound to the volume lands on a cluster node.
#[derive(Debug, Clone)]
pub struct WorkingDirectory {
    inner: Arc<WorkdirInner>,
}

#[derive(Debug)]
struct WorkdirInner {
    volume: String,
    owner: Uuid,
    node: OnceLock<String>,
    released: AtomicBool,
}

impl WorkingDirectory {
    pub(crate) fn new(volume: String, owner: Uuid) -> Self {
        Self {
            inner: Arc::new(WorkdirInner {
                volume,
                owner,
                node: OnceLock::new(),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn volume(&self) -> &str {
        &self.inner.volume
    }

    pub fn node(&self) -> Option<&str> {
        self.inner.node.get().map(String::as_str)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub(crate) fn owner(&self) -> Uuid {
        self.inner.owner
    }

    /// First caller wins; later pins are ignored.
    pub(crate) fn pin_node(&self, node: String) {
        let _ = self.inner.node.set(node);
    }

    pub(crate) fn mark_released(&self) {
        self.inner.released.store(true, Ordering::Release);
    }
}

/// Sandbox lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Running,
    Exited,
    Destroyed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Created => "created",
            SandboxState::Running => "running",
            SandboxState::Exited => "exited",
            SandboxState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Result of one start() call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    /// `None` only when the process was still running at the deadline.
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Seconds between container start and finish; -1 when the engine's
    /// timestamps are inconsistent.
    pub duration: f64,
    pub timeout: bool,
    pub oom_killed: bool,
}
