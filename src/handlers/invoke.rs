//! Chained invocation of another durable function.
//!
//! Starting the operation hands the request to the backend; the downstream
//! execution resolves it out of band, exactly like a callback with a
//! function on the other end.

use crate::config::InvokeConfig;
use crate::context::OperationIdentifier;
use crate::error::EngineError;
use crate::handlers::{deserialize_result, expect_type, recorded_failure, serialize_payload};
use crate::operation::{InvokeOptions, OperationStatus, OperationType, OperationUpdate};
use crate::state::ExecutionState;
use crate::suspension::await_progress;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub(crate) async fn execute<P, T>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    function_name: String,
    payload: &P,
    config: InvokeConfig,
) -> Result<T, EngineError>
where
    P: Serialize + Sync,
    T: DeserializeOwned,
{
    let operation_id = ident.operation_id.clone();
    loop {
        match state.operation(&operation_id).await {
            None => {
                let mut update =
                    OperationUpdate::start(&operation_id, OperationType::ChainedInvoke)
                        .with_invoke_options(InvokeOptions {
                            function_name: function_name.clone(),
                        })
                        .with_payload(serialize_payload(payload)?);
                update.parent_id = ident.parent_id.clone();
                update.name = ident.name.clone();
                state.checkpoint(update).await?;
                debug!(
                    execution_id = %state.execution_id,
                    operation_id = %operation_id,
                    function = %function_name,
                    "chained invoke started"
                );
            }
            Some(op) => {
                expect_type(&op, OperationType::ChainedInvoke)?;
                match op.status {
                    OperationStatus::Succeeded => {
                        return deserialize_result(op.result.as_deref());
                    }
                    OperationStatus::Failed => return Err(recorded_failure(&op)),
                    OperationStatus::Cancelled
                    | OperationStatus::Stopped
                    | OperationStatus::TimedOut => {
                        return Err(EngineError::execution(format!(
                            "chained invoke {operation_id} ended as {:?}",
                            op.status
                        )));
                    }
                    OperationStatus::Started | OperationStatus::Ready => {
                        let deadline = config
                            .timeout
                            .and_then(|t| op.start_timestamp.map(|s| s + t.to_seconds() as f64));
                        await_progress(&state, &operation_id, deadline).await?;
                    }
                }
            }
        }
    }
}
