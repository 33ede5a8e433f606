//! Error types for arena-target.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for arena-target operations.
pub type Result<T> = std::result::Result<T, TargetError>;

/// Errors that can occur while provisioning or talking to a target.
#[derive(Debug, Error)]
pub enum TargetError {
    /// Bad target reference or provisioner configuration. Caller-fixable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Image build from a local build context failed.
    #[error("build failed: {message}")]
    Build {
        /// Short description of the failure
        message: String,
        /// Captured build output up to the failure
        log: String,
    },

    /// Target was created but never became usable (container exited,
    /// liveness probe budget exhausted, remote service reported failure).
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// A bounded wait elapsed before the target reported ready.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The bound that elapsed
        after: Duration,
    },

    /// Operation not available for this kind of target.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Failed to reach the controller inside the target.
    #[error("connection failed: {0}")]
    Connection(String),

    /// JSON-RPC error reported by the controller.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the controller
        code: i32,
        /// Error message from the controller
        message: String,
        /// Optional structured payload
        data: Option<serde_json::Value>,
    },

    /// Docker daemon error
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// HTTP error talking to the remote execution service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TargetError {
    /// True when the target reported a condition it cannot recover from.
    ///
    /// Transport failures count as fatal: once the controller connection is
    /// gone no further action can be applied.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Rpc { code, data, .. } => {
                *code == crate::client::error_codes::TARGET_FATAL
                    || data
                        .as_ref()
                        .and_then(|d| d.get("fatal"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
            }
            Self::Connection(_) | Self::Io(_) => true,
            _ => false,
        }
    }

    /// True when acquisition failed because a bounded wait elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
