//! Error types for the durable execution engine.
//!
//! The taxonomy distinguishes validation failures (illegal operation
//! transitions), concurrency failures (stale checkpoint tokens),
//! application failures raised by author code, backend failures at the
//! checkpoint client boundary, and the suspension signal that ends an
//! invocation without ending the execution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the durable execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Execution error that terminates the execution with FAILED status.
    #[error("execution error: {message}")]
    Execution {
        /// Error message describing what went wrong
        message: String,
        /// The reason the execution is terminating
        termination_reason: TerminationReason,
    },

    /// An operation update violated the legal-transition table.
    ///
    /// `rule` names the specific transition rule that rejected the update.
    #[error("validation error [{rule}]: {message}")]
    Validation {
        /// The transition rule that rejected the update
        rule: &'static str,
        /// Error message describing the violation
        message: String,
    },

    /// A checkpoint call used a stale token.
    ///
    /// Recovered locally by re-polling state; never surfaced to author code.
    #[error("concurrency error: {message}")]
    Concurrency {
        /// Error message describing the token conflict
        message: String,
    },

    /// Replay mismatch: the recorded history disagrees with the code path
    /// taken on this invocation.
    #[error("non-deterministic execution: {message}")]
    NonDeterministic {
        /// Error message describing the mismatch
        message: String,
        /// The operation id where the mismatch occurred
        operation_id: Option<String>,
    },

    /// Serialization or deserialization failure.
    #[error("serialization error: {message}")]
    SerDes {
        /// Error message describing the failure
        message: String,
    },

    /// Failure at the checkpoint backend boundary (network, throttling).
    #[error("backend error: {message}")]
    Backend {
        /// Error message describing the failure
        message: String,
        /// Whether the call may be retried
        retriable: bool,
    },

    /// Callback-specific failure (timeout, external rejection).
    #[error("callback error: {message}")]
    Callback {
        /// Error message describing the failure
        message: String,
        /// The callback identifier, if known
        callback_id: Option<String>,
    },

    /// Error raised by an author-supplied closure.
    #[error("user code error: {message}")]
    UserCode {
        /// Message from the author's error
        message: String,
        /// The author error's type name
        error_type: String,
        /// Optional stack trace captured from the author's error
        stack_trace: Option<String>,
    },

    /// Signal that this invocation ends early and a later invocation will
    /// continue the execution. Not a failure.
    #[error("execution suspended")]
    Suspended {
        /// When the engine expects forward progress to be possible again
        scheduled_end_timestamp: Option<f64>,
    },
}

impl EngineError {
    /// Creates a new Execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            termination_reason: TerminationReason::ExecutionError,
        }
    }

    /// Creates a new Validation error for the named transition rule.
    pub fn validation(rule: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            rule,
            message: message.into(),
        }
    }

    /// Creates a new Concurrency error.
    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::Concurrency {
            message: message.into(),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Creates a new retriable Backend error.
    pub fn backend_retriable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retriable: true,
        }
    }

    /// Creates a new non-retriable Backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retriable: false,
        }
    }

    /// Creates a new suspension signal.
    pub fn suspended() -> Self {
        Self::Suspended {
            scheduled_end_timestamp: None,
        }
    }

    /// Creates a new suspension signal with an expected resume time.
    pub fn suspended_until(timestamp: f64) -> Self {
        Self::Suspended {
            scheduled_end_timestamp: Some(timestamp),
        }
    }

    /// Returns true if this is the suspension signal.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// Returns true if this is a Backend error that may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Backend { retriable: true, .. })
    }

    /// Returns true if this is a stale-token concurrency error.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

/// Reason for ending an invocation or execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TerminationReason {
    /// Unhandled error in author code
    #[default]
    UnhandledError,
    /// Explicit execution error
    ExecutionError,
    /// Waiting on an external clock or event with nothing else running
    WaitingForEvent,
    /// Checkpoint exchange with the backend failed
    CheckpointFailed,
    /// Replay mismatch detected
    NonDeterministicExecution,
    /// Callback failed or timed out
    CallbackError,
    /// Serialization or deserialization failed
    SerializationError,
}

/// Serialized error details persisted with failed operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type/name
    #[serde(rename = "ErrorType")]
    pub error_type: String,
    /// The error message
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    /// Optional stack trace
    #[serde(rename = "StackTrace", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorObject {
    /// Creates a new ErrorObject.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    /// Creates a new ErrorObject with a stack trace.
    pub fn with_stack_trace(
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Some(stack_trace.into()),
        }
    }
}

impl From<&EngineError> for ErrorObject {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::Execution { message, .. } => ErrorObject::new("ExecutionError", message),
            EngineError::Validation { rule, message } => {
                ErrorObject::new("ValidationError", format!("[{rule}] {message}"))
            }
            EngineError::Concurrency { message } => ErrorObject::new("ConcurrencyError", message),
            EngineError::NonDeterministic { message, .. } => {
                ErrorObject::new("NonDeterministicExecutionError", message)
            }
            EngineError::SerDes { message } => ErrorObject::new("SerDesError", message),
            EngineError::Backend { message, .. } => ErrorObject::new("BackendError", message),
            EngineError::Callback { message, .. } => ErrorObject::new("CallbackError", message),
            EngineError::UserCode {
                message,
                error_type,
                stack_trace,
            } => {
                let mut obj = ErrorObject::new(error_type, message);
                obj.stack_trace = stack_trace.clone();
                obj
            }
            EngineError::Suspended { .. } => {
                ErrorObject::new("SuspendedExecution", "Execution suspended")
            }
        }
    }
}

impl From<ErrorObject> for EngineError {
    fn from(error: ErrorObject) -> Self {
        Self::UserCode {
            message: error.error_message,
            error_type: error.error_type,
            stack_trace: error.stack_trace,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for EngineError {
    fn from(error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::UserCode {
            message: error.to_string(),
            error_type: "UserCodeError".to_string(),
            stack_trace: None,
        }
    }
}
