//! Callbacks completed by external systems.
//!
//! Creating a callback checkpoints a CALLBACK operation; the backend
//! assigns the callback id that external parties use to complete, fail,
//! or heartbeat it out of band. The handle's `result` future replays the
//! recorded resolution or hands the blocked operation to the suspension
//! protocol.

use crate::config::CallbackConfig;
use crate::context::OperationIdentifier;
use crate::error::EngineError;
use crate::handlers::{deserialize_result, expect_type, recorded_failure};
use crate::operation::{CallbackOptions, OperationStatus, OperationType, OperationUpdate};
use crate::state::ExecutionState;
use crate::suspension::await_progress;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// A created callback: its id for external completion plus a future for
/// its eventual result.
pub struct CallbackHandle<T> {
    callback_id: String,
    operation_id: String,
    state: Arc<ExecutionState>,
    _result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> CallbackHandle<T> {
    /// The backend-issued id external systems complete the callback with.
    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    /// The recorded operation id.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Resolves with the callback's payload once it is completed.
    pub async fn result(&self) -> Result<T, EngineError> {
        loop {
            let op = self
                .state
                .operation(&self.operation_id)
                .await
                .ok_or_else(|| {
                    EngineError::backend(format!(
                        "callback operation {} missing from history",
                        self.operation_id
                    ))
                })?;
            expect_type(&op, OperationType::Callback)?;
            match op.status {
                OperationStatus::Succeeded => {
                    debug!(
                        execution_id = %self.state.execution_id,
                        operation_id = %self.operation_id,
                        replayed = true,
                        "callback resolved"
                    );
                    return deserialize_result(op.result.as_deref());
                }
                OperationStatus::Failed => return Err(recorded_failure(&op)),
                OperationStatus::TimedOut => {
                    return Err(EngineError::Callback {
                        message: op
                            .error
                            .map(|e| e.error_message)
                            .unwrap_or_else(|| "callback timed out".to_string()),
                        callback_id: Some(self.callback_id.clone()),
                    });
                }
                OperationStatus::Cancelled | OperationStatus::Stopped => {
                    return Err(EngineError::Callback {
                        message: format!("callback ended as {:?}", op.status),
                        callback_id: Some(self.callback_id.clone()),
                    });
                }
                OperationStatus::Started | OperationStatus::Ready => {
                    await_progress(&self.state, &self.operation_id, op.scheduled_end_timestamp)
                        .await?;
                }
            }
        }
    }
}

pub(crate) async fn create<T: DeserializeOwned>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    config: CallbackConfig,
) -> Result<CallbackHandle<T>, EngineError> {
    let operation_id = ident.operation_id.clone();
    let op = match state.operation(&operation_id).await {
        Some(op) => {
            expect_type(&op, OperationType::Callback)?;
            op
        }
        None => {
            let mut update = OperationUpdate::start(&operation_id, OperationType::Callback)
                .with_callback_options(CallbackOptions {
                    timeout_seconds: config.timeout.map(|d| d.to_seconds()),
                    heartbeat_timeout_seconds: config.heartbeat_timeout.map(|d| d.to_seconds()),
                });
            update.parent_id = ident.parent_id.clone();
            update.name = ident.name.clone();
            state.checkpoint(update).await?
        }
    };
    let callback_id = op.callback_id.ok_or_else(|| {
        EngineError::backend(format!(
            "backend did not assign a callback id to operation {operation_id}"
        ))
    })?;
    Ok(CallbackHandle {
        callback_id,
        operation_id,
        state,
        _result: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CheckpointClient, InMemoryCheckpointClient};
    use crate::duration::Duration;
    use crate::error::ErrorObject;

    fn ident(id: &str) -> OperationIdentifier {
        OperationIdentifier {
            operation_id: id.to_string(),
            parent_id: None,
            name: Some("approval".to_string()),
        }
    }

    async fn fresh_state(
        client: &Arc<InMemoryCheckpointClient>,
    ) -> (String, Arc<ExecutionState>) {
        let resp = client.start_execution(None).await.unwrap();
        let state = ExecutionState::new(
            Arc::clone(client) as Arc<dyn CheckpointClient>,
            resp.execution_id.clone(),
            resp.checkpoint_token,
            resp.operations,
            None,
        );
        (resp.execution_id, state)
    }

    #[tokio::test]
    async fn test_create_assigns_callback_id() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (_execution_id, state) = fresh_state(&client).await;
        let handle: CallbackHandle<String> =
            create(state, ident("1"), CallbackConfig::new()).await.unwrap();
        assert!(handle.callback_id().starts_with("cb-"));
    }

    #[tokio::test]
    async fn test_pending_callback_suspends() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (_execution_id, state) = fresh_state(&client).await;
        let handle: CallbackHandle<String> = create(
            state,
            ident("1"),
            CallbackConfig::new().with_timeout(Duration::from_hours(1)),
        )
        .await
        .unwrap();
        let result = handle.result().await;
        assert!(matches!(result, Err(EngineError::Suspended { .. })));
    }

    #[tokio::test]
    async fn test_completed_callback_resolves() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (_execution_id, state) = fresh_state(&client).await;
        let handle: CallbackHandle<String> =
            create(Arc::clone(&state), ident("1"), CallbackConfig::new())
                .await
                .unwrap();

        client
            .complete_callback(handle.callback_id(), Some("\"approved\"".to_string()))
            .await
            .unwrap();
        state.refresh().await.unwrap();

        let value = handle.result().await.unwrap();
        assert_eq!(value, "approved");
    }

    #[tokio::test]
    async fn test_failed_callback_surfaces_error() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (_execution_id, state) = fresh_state(&client).await;
        let handle: CallbackHandle<String> =
            create(Arc::clone(&state), ident("1"), CallbackConfig::new())
                .await
                .unwrap();

        client
            .fail_callback(
                handle.callback_id(),
                ErrorObject::new("Rejected", "request denied"),
            )
            .await
            .unwrap();
        state.refresh().await.unwrap();

        let result = handle.result().await;
        match result {
            Err(EngineError::UserCode { error_type, .. }) => assert_eq!(error_type, "Rejected"),
            other => panic!("expected UserCode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timed_out_callback() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (_execution_id, state) = fresh_state(&client).await;
        let handle: CallbackHandle<String> = create(
            Arc::clone(&state),
            ident("1"),
            CallbackConfig::new().with_timeout(Duration::from_seconds(30)),
        )
        .await
        .unwrap();

        client.advance_clock(31.0).await;
        state.refresh().await.unwrap();

        let result = handle.result().await;
        assert!(matches!(result, Err(EngineError::Callback { .. })));
    }

    #[tokio::test]
    async fn test_replayed_create_reuses_callback_id() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;
        let first: CallbackHandle<String> =
            create(state, ident("1"), CallbackConfig::new()).await.unwrap();

        let invocation = client.start_invocation(&execution_id).await.unwrap();
        let page = client.poll_state(&execution_id, None).await.unwrap();
        let state2 = ExecutionState::new(
            Arc::clone(&client) as Arc<dyn CheckpointClient>,
            execution_id,
            invocation.checkpoint_token,
            page.operations,
            None,
        );
        let second: CallbackHandle<String> =
            create(state2, ident("1"), CallbackConfig::new()).await.unwrap();
        assert_eq!(first.callback_id(), second.callback_id());
    }
}
