//! Concurrency combinators over already-created operation futures.
//!
//! Each combinator records its aggregation or selection as one STEP, so a
//! later invocation replays the decision without re-driving the inner
//! futures. The inner operations checkpoint themselves; the combinator
//! only memoizes which outcome it surfaced. Ids stay deterministic because
//! every inner future fixed its operation id when it was created, before
//! the combinator ever polled it.
//!
//! Inner futures are driven on the combinator's own task, never spawned.
//! When a selection is decided the losers are dropped synchronously, so a
//! losing branch cannot observe a half-settled world. A suspension signal
//! from one operation is parked, not surfaced immediately: a sibling that
//! settles for real still decides the combinator, and only when every
//! remaining operation is blocked does the suspension propagate.

use crate::context::{BoxedOperation, OperationIdentifier};
use crate::error::{EngineError, ErrorObject};
use crate::handlers::{deserialize_result, expect_type, recorded_failure, serialize_payload};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use crate::state::ExecutionState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::Poll;
use tracing::debug;

/// Outcome of one operation under `all_settled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettledOutcome<T> {
    /// Position of the operation in the input vector
    #[serde(rename = "Index")]
    pub index: usize,
    /// Whether the operation succeeded
    #[serde(rename = "Succeeded")]
    pub succeeded: bool,
    /// The success value, when succeeded
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    /// The failure details, when not
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Replays a recorded combinator outcome, or records its START.
///
/// `Ok(Some(_))` is the memoized outcome; `Ok(None)` means the inner
/// futures must be driven on this invocation.
async fn replay_or_start<T: DeserializeOwned>(
    state: &Arc<ExecutionState>,
    ident: &OperationIdentifier,
    sub_type: &str,
) -> Result<Option<T>, EngineError> {
    match state.operation(&ident.operation_id).await {
        Some(op) => {
            expect_type(&op, OperationType::Step)?;
            match op.status {
                OperationStatus::Succeeded => {
                    debug!(
                        execution_id = %state.execution_id,
                        operation_id = %ident.operation_id,
                        combinator = sub_type,
                        replayed = true,
                        "combinator outcome replayed from history"
                    );
                    Ok(Some(deserialize_result(op.result.as_deref())?))
                }
                OperationStatus::Failed => Err(recorded_failure(&op)),
                OperationStatus::Cancelled
                | OperationStatus::Stopped
                | OperationStatus::TimedOut => Err(EngineError::execution(format!(
                    "combinator {} ended as {:?}",
                    ident.operation_id, op.status
                ))),
                OperationStatus::Started | OperationStatus::Ready => Ok(None),
            }
        }
        None => {
            let mut update = OperationUpdate::start(&ident.operation_id, OperationType::Step);
            update.parent_id = ident.parent_id.clone();
            update.name = ident.name.clone();
            update.sub_type = Some(sub_type.to_string());
            state.checkpoint(update).await?;
            Ok(None)
        }
    }
}

/// Polls every remaining operation and resolves with the next settlement,
/// or `None` once all slots are empty. Dropping the slot vector cancels
/// whatever has not settled.
async fn next_settled<T>(
    slots: &mut [Option<BoxedOperation<T>>],
) -> Option<(usize, Result<T, EngineError>)> {
    std::future::poll_fn(|cx| {
        let mut any_pending = false;
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(operation) = slot else { continue };
            match operation.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    *slot = None;
                    return Poll::Ready(Some((index, result)));
                }
                Poll::Pending => any_pending = true,
            }
        }
        if any_pending {
            Poll::Pending
        } else {
            Poll::Ready(None)
        }
    })
    .await
}

fn into_slots<T>(operations: Vec<BoxedOperation<T>>) -> Vec<Option<BoxedOperation<T>>> {
    operations.into_iter().map(Some).collect()
}

// Takes the payload pre-serialized so no borrow of the value is held
// across the checkpoint await; the combinator futures stay Send without
// requiring Sync payloads.
async fn record_success(
    state: &Arc<ExecutionState>,
    operation_id: &str,
    payload: String,
) -> Result<(), EngineError> {
    let update = OperationUpdate::succeed(operation_id, OperationType::Step, Some(payload));
    state.checkpoint(update).await?;
    Ok(())
}

async fn record_failure(
    state: &Arc<ExecutionState>,
    operation_id: &str,
    error: &EngineError,
) -> Result<(), EngineError> {
    let update =
        OperationUpdate::fail(operation_id, OperationType::Step, ErrorObject::from(error));
    state.checkpoint(update).await?;
    Ok(())
}

/// All operations must succeed; the temporally first failure fails the
/// combinator and the rest are cancelled.
pub(crate) async fn all<T>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    operations: Vec<BoxedOperation<T>>,
) -> Result<Vec<T>, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    if let Some(stored) = replay_or_start(&state, &ident, "all").await? {
        return Ok(stored);
    }

    let count = operations.len();
    let mut slots = into_slots(operations);
    let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
    let mut suspended: Option<EngineError> = None;
    while let Some((index, result)) = next_settled(&mut slots).await {
        match result {
            Ok(value) => results[index] = Some(value),
            Err(error) if error.is_suspended() => {
                if suspended.is_none() {
                    suspended = Some(error);
                }
            }
            Err(error) => {
                drop(slots);
                record_failure(&state, &ident.operation_id, &error).await?;
                return Err(error);
            }
        }
    }
    if let Some(error) = suspended {
        return Err(error);
    }

    let values: Vec<T> = results.into_iter().flatten().collect();
    let payload = serialize_payload(&values)?;
    record_success(&state, &ident.operation_id, payload).await?;
    Ok(values)
}

/// First settled operation wins, success or failure; losers are cancelled.
pub(crate) async fn race<T>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    operations: Vec<BoxedOperation<T>>,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    if let Some(stored) = replay_or_start(&state, &ident, "race").await? {
        return Ok(stored);
    }
    if operations.is_empty() {
        let error = EngineError::execution("race over zero operations");
        record_failure(&state, &ident.operation_id, &error).await?;
        return Err(error);
    }

    let mut slots = into_slots(operations);
    let mut suspended: Option<EngineError> = None;
    while let Some((_index, result)) = next_settled(&mut slots).await {
        match result {
            Ok(value) => {
                drop(slots);
                let payload = serialize_payload(&value)?;
                record_success(&state, &ident.operation_id, payload).await?;
                return Ok(value);
            }
            Err(error) if error.is_suspended() => {
                // Blocked, not settled; another operation may still win.
                if suspended.is_none() {
                    suspended = Some(error);
                }
            }
            Err(error) => {
                drop(slots);
                record_failure(&state, &ident.operation_id, &error).await?;
                return Err(error);
            }
        }
    }

    Err(suspended.unwrap_or_else(|| EngineError::execution("race settled without a result")))
}

/// First success wins; fails only when every operation has failed.
pub(crate) async fn any<T>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    operations: Vec<BoxedOperation<T>>,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    if let Some(stored) = replay_or_start(&state, &ident, "any").await? {
        return Ok(stored);
    }

    let count = operations.len();
    let mut slots = into_slots(operations);
    let mut first_error: Option<EngineError> = None;
    let mut suspended: Option<EngineError> = None;
    while let Some((_index, result)) = next_settled(&mut slots).await {
        match result {
            Ok(value) => {
                drop(slots);
                let payload = serialize_payload(&value)?;
                record_success(&state, &ident.operation_id, payload).await?;
                return Ok(value);
            }
            Err(error) if error.is_suspended() => {
                if suspended.is_none() {
                    suspended = Some(error);
                }
            }
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }
    // A blocked operation could still succeed later; only an all-failed
    // outcome is final.
    if let Some(error) = suspended {
        return Err(error);
    }

    let error = EngineError::Execution {
        message: match &first_error {
            Some(first) => format!("all {count} operations failed, first: {first}"),
            None => "any over zero operations".to_string(),
        },
        termination_reason: crate::error::TerminationReason::ExecutionError,
    };
    record_failure(&state, &ident.operation_id, &error).await?;
    Err(error)
}

/// Waits for every operation to settle and records all outcomes; never
/// fails on an inner failure.
pub(crate) async fn all_settled<T>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    operations: Vec<BoxedOperation<T>>,
) -> Result<Vec<SettledOutcome<T>>, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    if let Some(stored) = replay_or_start(&state, &ident, "allSettled").await? {
        return Ok(stored);
    }

    let count = operations.len();
    let mut slots = into_slots(operations);
    let mut outcomes: Vec<Option<SettledOutcome<T>>> = (0..count).map(|_| None).collect();
    let mut suspended: Option<EngineError> = None;
    while let Some((index, result)) = next_settled(&mut slots).await {
        outcomes[index] = Some(match result {
            Ok(value) => SettledOutcome {
                index,
                succeeded: true,
                result: Some(value),
                error: None,
            },
            Err(error) if error.is_suspended() => {
                if suspended.is_none() {
                    suspended = Some(error);
                }
                continue;
            }
            Err(error) => SettledOutcome {
                index,
                succeeded: false,
                result: None,
                error: Some(ErrorObject::from(&error)),
            },
        });
    }
    if let Some(error) = suspended {
        return Err(error);
    }

    let outcomes: Vec<SettledOutcome<T>> = outcomes.into_iter().flatten().collect();
    let payload = serialize_payload(&outcomes)?;
    record_success(&state, &ident.operation_id, payload).await?;
    Ok(outcomes)
}
