// Outcome interpretation - reads a terminated container's recorded state

use super::engine::{ContainerEngine, ContainerState};
use super::error::Result;
use chrono::DateTime;
use nix::sys::signal::Signal;
use tracing::error;

/// What a finished container reports back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub exit_code: i64,
    /// Seconds between start and finish, -1 when inconsistent.
    pub duration: f64,
    pub oom_killed: bool,
}

impl Outcome {
    pub fn from_state(state: &ContainerState) -> Self {
        Self {
            exit_code: state.exit_code.unwrap_or(-1),
            duration: elapsed_seconds(state.started_at.as_deref(), state.finished_at.as_deref()),
            oom_killed: state.oom_killed.unwrap_or(false),
        }
    }
}

/// Refresh the container state from the engine and interpret it.
pub async fn inspect_exited(engine: &dyn ContainerEngine, container_id: &str) -> Result<Outcome> {
    let state = engine.inspect_container(container_id).await.map_err(|e| {
        error!(container = %container_id, error = %e, "Failed to load the container from the Docker engine");
        e
    })?;
    Ok(Outcome::from_state(&state))
}

/// `finished - started` in seconds; -1 for negative or unparsable values.
pub fn elapsed_seconds(started_at: Option<&str>, finished_at: Option<&str>) -> f64 {
    let (Some(started), Some(finished)) = (started_at, finished_at) else {
        return -1.0;
    };
    let (Ok(started), Ok(finished)) = (
        DateTime::parse_from_rfc3339(started),
        DateTime::parse_from_rfc3339(finished),
    ) else {
        return -1.0;
    };

    let seconds = (finished - started)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(-1.0);
    if seconds < 0.0 {
        -1.0
    } else {
        seconds
    }
}

/// Whether the exit status encodes death by SIGKILL or SIGXCPU.
///
/// Paired with the CPU ulimit this is how a CPU-time violation is detected.
/// It is a heuristic: a process killed by either signal for any other reason
/// is classified the same way.
pub fn is_killed_by_signal(exit_code: i64) -> bool {
    let signal = exit_code - 128;
    signal == Signal::SIGKILL as i64 || signal == Signal::SIGXCPU as i64
}
