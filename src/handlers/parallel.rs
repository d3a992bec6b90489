//! Concurrent fan-out over heterogeneous branches.
//!
//! The fan-out itself is a CONTEXT operation; each branch runs in its own
//! child context beneath it. Branch operation ids are derived up front in
//! branch order, so scheduling cannot perturb the id sequence. Results
//! come back in branch order; a failed branch fails the fan-out with the
//! temporally first error.

use crate::context::{BranchFn, ExecutionContext, OperationIdentifier};
use crate::error::{EngineError, ErrorObject};
use crate::handlers::{deserialize_result, expect_type, recorded_failure, serialize_payload};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) async fn execute<T>(
    parent: ExecutionContext,
    ident: OperationIdentifier,
    branches: Vec<BranchFn<T>>,
) -> Result<Vec<T>, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
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
                        "parallel block replayed from history"
                    );
                    return deserialize_result(op.result.as_deref());
                }
                OperationStatus::Failed => return Err(recorded_failure(&op)),
                OperationStatus::Cancelled
                | OperationStatus::Stopped
                | OperationStatus::TimedOut => {
                    return Err(EngineError::execution(format!(
                        "parallel block {operation_id} ended as {:?}",
                        op.status
                    )));
                }
                OperationStatus::Started | OperationStatus::Ready => {}
            }
        }
        None => {
            let mut update = OperationUpdate::start(&operation_id, OperationType::Context);
            update.parent_id = ident.parent_id.clone();
            update.name = ident.name.clone();
            update.sub_type = Some("parallel".to_string());
            state.checkpoint(update).await?;
        }
    }

    // The parent context is off limits inside branch bodies, same as in a
    // plain child context.
    let _scope = parent.enter_scope();
    let aggregate = parent.child(&operation_id);
    // Branch ids assigned in branch order, before anything is spawned.
    let idents: Vec<OperationIdentifier> =
        branches.iter().map(|_| aggregate.identifier(None)).collect();

    let branch_count = branches.len();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(branch_count);
    for (index, (branch, branch_ident)) in branches.into_iter().zip(idents).enumerate() {
        let tx = tx.clone();
        let ctx = aggregate.clone();
        handles.push(tokio::spawn(async move {
            let result =
                crate::handlers::child::execute(ctx, branch_ident, move |child| branch(child))
                    .await;
            let _ = tx.send((index, result));
        }));
    }
    drop(tx);

    let mut results: Vec<Option<T>> = (0..branch_count).map(|_| None).collect();
    let mut first_error: Option<EngineError> = None;
    let mut suspended: Option<EngineError> = None;
    while let Some((index, result)) = rx.recv().await {
        match result {
            Ok(value) => results[index] = Some(value),
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
    for handle in handles {
        let _ = handle.await;
    }

    if let Some(error) = suspended {
        return Err(error);
    }
    if let Some(error) = first_error {
        let update = OperationUpdate::fail(
            &operation_id,
            OperationType::Context,
            ErrorObject::from(&error),
        );
        state.checkpoint(update).await?;
        return Err(error);
    }

    let values: Vec<T> = results.into_iter().flatten().collect();
    let payload = serialize_payload(&values)?;
    let update = OperationUpdate::succeed(&operation_id, OperationType::Context, Some(payload));
    state.checkpoint(update).await?;
    Ok(values)
}
