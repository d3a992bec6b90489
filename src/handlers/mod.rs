//! Primitive handlers.
//!
//! Each handler owns the full replay-aware lifecycle of one primitive:
//! look up recorded state, short-circuit on replay, checkpoint fresh
//! transitions, and hand blocked operations to the suspension protocol.

pub(crate) mod callback;
pub(crate) mod child;
pub(crate) mod combinators;
pub(crate) mod invoke;
pub(crate) mod map;
pub(crate) mod parallel;
pub(crate) mod step;
pub(crate) mod wait;

use crate::error::{EngineError, ErrorObject};
use crate::operation::{Operation, OperationType};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Boxed error returned by author closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Rejects a recorded operation whose type does not match the code path
/// replaying it. The id scheme guarantees this only happens when the
/// author's code changed between invocations.
pub(crate) fn expect_type(op: &Operation, expected: OperationType) -> Result<(), EngineError> {
    if op.operation_type != expected {
        return Err(EngineError::NonDeterministic {
            message: format!(
                "operation {} was recorded as {:?} but is being replayed as {:?}",
                op.operation_id, op.operation_type, expected
            ),
            operation_id: Some(op.operation_id.clone()),
        });
    }
    Ok(())
}

pub(crate) fn serialize_payload<T: Serialize>(value: &T) -> Result<String, EngineError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserializes a recorded result; an absent payload reads as JSON null
/// so unit-returning operations replay cleanly.
pub(crate) fn deserialize_result<T: DeserializeOwned>(
    result: Option<&str>,
) -> Result<T, EngineError> {
    Ok(serde_json::from_str(result.unwrap_or("null"))?)
}

/// Converts an author error into its persisted form.
pub(crate) fn error_object_from_user(error: &BoxError) -> ErrorObject {
    ErrorObject::new("UserCodeError", error.to_string())
}

/// Surfaces a recorded failure back to author code.
pub(crate) fn recorded_failure(op: &Operation) -> EngineError {
    match &op.error {
        Some(error) => error.clone().into(),
        None => EngineError::execution(format!(
            "operation {} ended as {:?}",
            op.operation_id, op.status
        )),
    }
}
