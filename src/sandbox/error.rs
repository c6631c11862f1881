// Error types for the container sandbox

use super::types::SandboxState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Main sandbox error type
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Docker error: {0}")]
    Engine(String),

    #[error("Sandbox {sandbox} is {actual}, expected {expected}")]
    StateViolation {
        sandbox: String,
        expected: String,
        actual: SandboxState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(e: bollard::errors::Error) -> Self {
        SandboxError::Engine(e.to_string())
    }
}

impl SandboxError {
    /// Convert error to a structured report for logs and `--json` output
    pub fn to_error_report(&self, sandbox_id: Option<&str>, context: Option<HashMap<String, String>>) -> ErrorReport {
        let (error_code, suggestion) = match self {
            SandboxError::InvalidArgument(_) => (
                "INVALID_ARGUMENT",
                "Check the profile name, working directory handle, file names and limit values",
            ),
            SandboxError::Engine(_) => (
                "DOCKER_ERROR",
                "Ensure the Docker engine is reachable and the profile image exists",
            ),
            SandboxError::StateViolation { .. } => (
                "SANDBOX_STATE_VIOLATION",
                "A sandbox was used after it was destroyed or while it was still running",
            ),
            SandboxError::Io(_) => (
                "IO_ERROR",
                "Check the Docker socket permissions",
            ),
        };

        let mut error_context = context.unwrap_or_default();
        if let Some(id) = sandbox_id {
            error_context.insert("sandbox_id".to_string(), id.to_string());
        }

        ErrorReport {
            error_code: error_code.to_string(),
            error_message: self.to_string(),
            timestamp: Utc::now(),
            context: error_context,
            suggestion: suggestion.to_string(),
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SandboxError::StateViolation { .. } => ErrorSeverity::Critical,
            SandboxError::Engine(_) => ErrorSeverity::Error,
            SandboxError::Io(_) => ErrorSeverity::Error,
            SandboxError::InvalidArgument(_) => ErrorSeverity::Warning,
        }
    }

    /// Engine and transport failures may succeed on a later attempt; caller
    /// mistakes never do.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SandboxError::Engine(_) | SandboxError::Io(_))
    }
}

/// Failure of one attach stream session.
///
/// Kept apart from [`SandboxError`] so the manager decides explicitly what a
/// missed deadline means to the caller.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("Container didn't terminate after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Attach stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Start(#[from] SandboxError),
}

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Convert error to detailed error report
    pub fn to_error_report(&self, context: Option<HashMap<String, String>>) -> ErrorReport {
        let (error_code, suggestion) = match self {
            ConfigError::MissingField(_) => (
                "CONFIG_MISSING_FIELD",
                "Add the required field to the configuration file",
            ),
            ConfigError::InvalidValue(_) => (
                "CONFIG_INVALID_VALUE",
                "Check the configuration value against the allowed range or format",
            ),
            ConfigError::Io(_) => (
                "CONFIG_IO_ERROR",
                "Check file permissions and ensure the configuration file exists",
            ),
            ConfigError::Json(_) => (
                "CONFIG_JSON_ERROR",
                "Validate the JSON syntax in the configuration file",
            ),
        };

        ErrorReport {
            error_code: error_code.to_string(),
            error_message: self.to_string(),
            timestamp: Utc::now(),
            context: context.unwrap_or_default(),
            suggestion: suggestion.to_string(),
        }
    }
}

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Programming error in the caller
    Critical,
    /// Infrastructure failure
    Error,
    /// Rejected input
    Warning,
}

/// Detailed error report structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error code (e.g., "DOCKER_ERROR")
    pub error_code: String,

    /// Human-readable error message
    pub error_message: String,

    /// Timestamp when the error occurred
    pub timestamp: DateTime<Utc>,

    /// Additional context information
    pub context: HashMap<String, String>,

    /// Suggestion for resolving the error
    pub suggestion: String,
}

impl ErrorReport {
    /// Convert error report to JSON string
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Create error report from JSON string
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
