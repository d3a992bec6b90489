//! Nested execution scopes.
//!
//! A child context groups operations under a CONTEXT record with its own
//! id namespace. The parent context may not be used inside the body it
//! opened; the reentrancy guard enforces that at runtime. A completed
//! context replays its recorded result without re-running the body.

use crate::context::{ExecutionContext, OperationIdentifier};
use crate::error::{EngineError, ErrorObject};
use crate::handlers::{deserialize_result, expect_type, recorded_failure, serialize_payload};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

pub(crate) async fn execute<T, F, Fut>(
    parent: ExecutionContext,
    ident: OperationIdentifier,
    body: F,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(ExecutionContext) -> Fut + Send,
    Fut: Future<Output = Result<T, EngineError>> + Send,
{
    let state = parent.state();
    let operation_id = ident.operation_id.clone();

    match state.operation(&operation_id).await {
        Some(op) => {
            expect_type(&op, OperationType::Context)?;
            match op.status {
                OperationStatus::Succeeded => {
                    debug!(
                        execution_id = %state.execution_id,
                        operation_id = %operation_id,
                        replayed = true,
                        "child context replayed from history"
                    );
                    return deserialize_result(op.result.as_deref());
                }
                OperationStatus::Failed => return Err(recorded_failure(&op)),
                OperationStatus::Cancelled
                | OperationStatus::Stopped
                | OperationStatus::TimedOut => {
                    return Err(EngineError::execution(format!(
                        "child context {operation_id} ended as {:?}",
                        op.status
                    )));
                }
                // Started on a prior invocation; re-enter the body and let
                // its inner operations replay.
                OperationStatus::Started | OperationStatus::Ready => {}
            }
        }
        None => {
            let mut update = OperationUpdate::start(&operation_id, OperationType::Context);
            update.parent_id = ident.parent_id.clone();
            update.name = ident.name.clone();
            state.checkpoint(update).await?;
        }
    }

    let child = parent.child(&operation_id);
    let outcome = {
        let _scope = parent.enter_scope();
        body(child).await
    };

    match outcome {
        Ok(value) => {
            let payload = serialize_payload(&value)?;
            let update =
                OperationUpdate::succeed(&operation_id, OperationType::Context, Some(payload));
            state.checkpoint(update).await?;
            Ok(value)
        }
        Err(error) if error.is_suspended() => Err(error),
        Err(error) => {
            let update = OperationUpdate::fail(
                &operation_id,
                OperationType::Context,
                ErrorObject::from(&error),
            );
            state.checkpoint(update).await?;
            Err(error)
        }
    }
}
