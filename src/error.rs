//! Error types for beliefstream.
//!
//! All errors are strongly typed using thiserror. Validation errors are raised
//! synchronously to the caller; execution errors describe the failure of a
//! single pass (or lifecycle misuse) and never halt a running engine.

use thiserror::Error;

/// Validation errors raised while constructing or configuring an engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Iteration count must be at least 1, got {value}")]
    InvalidIterationCount {
        value: u32,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Variable name cannot be empty")]
    EmptyVariableName,

    #[error("Unknown variable '{variable}'")]
    UnknownVariable {
        variable: String,
    },

    #[error("Variable '{variable}' is not tracked in history")]
    NotTracked {
        variable: String,
    },

    #[error("Energy tracking is disabled for this engine")]
    EnergyTrackingDisabled,

    #[error("Auto-update rule for '{target}' is invalid: {reason}")]
    InvalidAutoUpdateRule {
        target: String,
        reason: String,
    },

    #[error("Queue capacity must be at least 1 when bounded")]
    InvalidQueueCapacity,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors: per-pass failures and lifecycle misuse.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("No initial belief for variable '{variable}'")]
    MissingInitialBelief {
        variable: String,
    },

    #[error("Inference diverged at iteration {iteration}: {reason}")]
    InferenceDivergence {
        iteration: u32,
        reason: String,
    },

    #[error("Auto-update for '{target}' failed: {reason}")]
    AutoUpdateFailed {
        target: String,
        reason: String,
    },

    #[error("Listener '{listener}' failed: {message}")]
    ListenerFailure {
        listener: String,
        message: String,
    },

    #[error("Event queue is full (capacity {capacity}); observation dropped")]
    QueueFull {
        capacity: usize,
    },

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine was never started")]
    NeverStarted,

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Top-level error type for beliefstream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl EngineError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the error is confined to a single pass.
    ///
    /// Such errors are reported on the error channel and the engine keeps
    /// processing later observations.
    #[must_use]
    pub const fn is_per_event(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::MissingInitialBelief { .. }
                    | ExecutionError::InferenceDivergence { .. }
                    | ExecutionError::AutoUpdateFailed { .. }
                    | ExecutionError::ListenerFailure { .. }
                    | ExecutionError::QueueFull { .. }
            ),
            _ => false,
        }
    }
}

/// Result type alias for beliefstream operations.
pub type EngineResult<T> = Result<T, EngineError>;

pub(crate) fn poisoned(what: &str) -> EngineError {
    EngineError::internal(format!("{what} lock poisoned"))
}
