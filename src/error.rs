//! Error types for sensorgate.
//!
//! All errors in sensorgate are strongly typed using thiserror.
//! The grouping follows how the error is handled: validation errors are
//! dropped where they are detected, execution errors end the current trigger
//! cycle, and transport errors are reported to whoever initiated delivery.

use serde::Serialize;
use thiserror::Error;

use crate::sensor::NodePhase;
use crate::storage::StoreError;

/// Validation errors: rejected locally, logged, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed notification: {reason}")]
    MalformedNotification {
        reason: String,
    },

    #[error("Unknown signal source '{signal}'")]
    UnknownSignalSource {
        signal: String,
    },

    #[error("Signal '{signal}' is already complete")]
    SignalAlreadyComplete {
        signal: String,
    },

    #[error("Sensor is not accepting notifications in phase {phase}")]
    SensorNotAccepting {
        phase: NodePhase,
    },

    #[error("Unsupported event content type '{content_type}'")]
    UnsupportedContentType {
        content_type: String,
    },

    #[error("Invalid event payload: {reason}")]
    InvalidPayload {
        reason: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid {field} name '{name}': {reason}")]
    InvalidName {
        field: String,
        name: String,
        reason: String,
    },

    #[error("Duplicate {field} name '{name}'")]
    DuplicateName {
        field: String,
        name: String,
    },
}

/// Execution errors that end the current cycle.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Trigger '{trigger}' failed: {message}")]
    TriggerFailed {
        trigger: String,
        message: String,
    },

    #[error("Persisting sensor '{sensor}' failed after {attempts} attempt(s): {message}")]
    PersistenceFailed {
        sensor: String,
        attempts: u32,
        message: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("No active stream for '{key}'")]
    NoActiveStream {
        key: String,
    },

    #[error("A stream is already open for '{key}'")]
    StreamAlreadyOpen {
        key: String,
    },

    #[error("Sensor '{sensor}' was moved to Error by another writer")]
    Preempted {
        sensor: String,
    },
}

/// A failed delivery of one event to one target sensor.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("Delivery to '{target}' failed: {cause}")]
pub struct DispatchError {
    /// Sensor name the delivery was addressed to.
    pub target: String,
    /// Human-readable failure cause.
    pub cause: String,
}

impl DispatchError {
    /// Creates a dispatch error for `target`.
    #[must_use]
    pub fn new(target: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            cause: cause.into(),
        }
    }
}

/// Transport errors between gateways and sensors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to read request payload: {message}")]
    PayloadReadError {
        message: String,
    },

    #[error("Service '{service}' did not become resolvable after {attempts} attempt(s)")]
    ResolutionTimeout {
        service: String,
        attempts: u32,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },
}

/// Top-level error type for sensorgate.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A state that should be unreachable. Never retried.
    #[error("Invariant violation: {reason}")]
    InvariantViolation {
        reason: String,
    },
}

impl SensorError {
    /// Creates an invariant violation.
    #[must_use]
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
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

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an invariant violation.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }

    /// Returns true if another writer moved the sensor to `Error` first.
    #[must_use]
    pub const fn is_preempted(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Preempted { .. }))
    }

    /// Returns true if a later attempt of the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::InvariantViolation { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::NoActiveStream { .. }
            ),
            Self::Transport(e) => !matches!(e, TransportError::PayloadReadError { .. }),
            Self::Storage(e) => e.is_retryable(),
        }
    }
}

/// Result type alias for sensorgate operations.
pub type SensorResult<T> = Result<T, SensorError>;
