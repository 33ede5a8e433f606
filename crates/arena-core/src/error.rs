//! Error types for arena-core.

use crate::action::ValidationError;
use arena_target::TargetError;
use thiserror::Error;

/// Result type alias for arena-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by environments, adapters and the runner.
///
/// The variants separate three situations a caller has to tell apart: the
/// target never became ready ([`CoreError::Provisioning`]), it became ready
/// and then failed ([`CoreError::UpstreamExecution`], [`CoreError::Setup`]),
/// or the caller's input was bad ([`CoreError::Validation`],
/// [`CoreError::UnsupportedAction`], [`CoreError::Configuration`]).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-fixable configuration problem
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Target acquisition failed; the environment never became ready
    #[error("provisioning failed: {0}")]
    Provisioning(#[source] TargetError),

    /// Action payload violates the canonical schema
    #[error("invalid action: {0}")]
    Validation(#[from] ValidationError),

    /// Raw agent action has no canonical equivalent
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// Runtime fault inside the target during step, evaluate or hot reload
    #[error("target execution failed: {0}")]
    UpstreamExecution(#[source] TargetError),

    /// Operation not available for this environment's target
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A setup call failed; later setup calls were not run
    #[error("setup call #{index} ({name}) failed: {source}")]
    Setup {
        /// Position of the failing call in the setup list
        index: usize,
        /// Function name of the failing call
        name: String,
        /// Underlying failure
        #[source]
        source: TargetError,
    },

    /// The environment has been closed
    #[error("environment is closed")]
    Closed,

    /// Operation not valid in the environment's current state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The agent's predict call failed
    #[error("agent error: {0}")]
    Agent(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True when acquisition failed because a bounded wait elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Provisioning(e) if e.is_timeout())
    }

    /// True when the target never became ready (build, probe, dispatch or timeout).
    pub fn never_ready(&self) -> bool {
        matches!(self, Self::Provisioning(_))
    }

    /// True when the error came from bad caller input.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::UnsupportedAction(_) | Self::Configuration(_)
        )
    }
}
