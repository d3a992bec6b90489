//! Step execution with retries.
//!
//! A step is the at-least-once unit of work. Completed steps replay from
//! history without re-running the closure; a failed attempt consults the
//! retry policy and either records a terminal FAIL or schedules the next
//! attempt with RETRY and waits for the backoff to elapse.

use crate::config::StepConfig;
use crate::context::OperationIdentifier;
use crate::duration::epoch_seconds;
use crate::error::EngineError;
use crate::handlers::{
    deserialize_result, error_object_from_user, expect_type, recorded_failure, serialize_payload,
    BoxError,
};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use crate::retry::{self, RetryDecision};
use crate::state::ExecutionState;
use crate::suspension::await_progress;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Per-attempt context handed to the step closure.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Zero-based attempt number
    pub attempt: u32,
}

pub(crate) async fn execute<T, F, Fut>(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    config: StepConfig,
    func: F,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send,
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    let operation_id = ident.operation_id.clone();
    loop {
        let attempt = match state.operation(&operation_id).await {
            None => {
                let mut update = OperationUpdate::start(&operation_id, OperationType::Step);
                update.parent_id = ident.parent_id.clone();
                update.name = ident.name.clone();
                update.sub_type = config.sub_type.clone();
                let op = state.checkpoint(update).await?;
                // A fenced START can come back as a record a newer
                // invocation already advanced; replay it instead of
                // running the closure.
                if op.status != OperationStatus::Started {
                    continue;
                }
                op.attempt
            }
            Some(op) => {
                expect_type(&op, OperationType::Step)?;
                match op.status {
                    OperationStatus::Succeeded => {
                        debug!(
                            execution_id = %state.execution_id,
                            operation_id = %operation_id,
                            replayed = true,
                            "step replayed from history"
                        );
                        return deserialize_result(op.result.as_deref());
                    }
                    OperationStatus::Failed => {
                        debug!(
                            execution_id = %state.execution_id,
                            operation_id = %operation_id,
                            replayed = true,
                            "step failure replayed from history"
                        );
                        return Err(recorded_failure(&op));
                    }
                    OperationStatus::Cancelled
                    | OperationStatus::Stopped
                    | OperationStatus::TimedOut => {
                        return Err(EngineError::execution(format!(
                            "step {operation_id} ended as {:?}",
                            op.status
                        )));
                    }
                    OperationStatus::Started => op.attempt,
                    OperationStatus::Ready => {
                        if op.is_runnable_at(epoch_seconds()) {
                            let update =
                                OperationUpdate::start(&operation_id, OperationType::Step);
                            let op = state.checkpoint(update).await?;
                            if op.status != OperationStatus::Started {
                                continue;
                            }
                            op.attempt
                        } else {
                            await_progress(&state, &operation_id, op.scheduled_end_timestamp)
                                .await?;
                            continue;
                        }
                    }
                }
            }
        };

        let outcome = {
            let _work = state.begin_work();
            func(StepContext { attempt }).await
        };

        match outcome {
            Ok(value) => {
                let payload = serialize_payload(&value)?;
                let update =
                    OperationUpdate::succeed(&operation_id, OperationType::Step, Some(payload));
                state.checkpoint(update).await?;
                return Ok(value);
            }
            Err(user_error) => {
                let error = error_object_from_user(&user_error);
                let attempt_number = attempt + 1;
                let policy = config.retry.clone().unwrap_or_default();
                match retry::decide(&error, attempt_number, &policy) {
                    RetryDecision::Stop => {
                        let update = OperationUpdate::fail(
                            &operation_id,
                            OperationType::Step,
                            error.clone(),
                        );
                        state.checkpoint(update).await?;
                        return Err(error.into());
                    }
                    RetryDecision::Retry { delay_seconds } => {
                        debug!(
                            execution_id = %state.execution_id,
                            operation_id = %operation_id,
                            attempt = attempt_number,
                            delay_seconds,
                            "step attempt failed, retry scheduled"
                        );
                        let update =
                            OperationUpdate::retry(&operation_id, OperationType::Step, delay_seconds)
                                .with_error(error);
                        state.checkpoint(update).await?;
                        let deadline = epoch_seconds() + delay_seconds as f64;
                        await_progress(&state, &operation_id, Some(deadline)).await?;
                        continue;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CheckpointClient, InMemoryCheckpointClient};
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ident(id: &str) -> OperationIdentifier {
        OperationIdentifier {
            operation_id: id.to_string(),
            parent_id: None,
            name: Some("test-step".to_string()),
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

    async fn resumed_state(
        client: &Arc<InMemoryCheckpointClient>,
        execution_id: &str,
    ) -> Arc<ExecutionState> {
        let invocation = client.start_invocation(execution_id).await.unwrap();
        let page = client.poll_state(execution_id, None).await.unwrap();
        ExecutionState::new(
            Arc::clone(client) as Arc<dyn CheckpointClient>,
            execution_id.to_string(),
            invocation.checkpoint_token,
            page.operations,
            None,
        )
    }

    #[tokio::test]
    async fn test_step_runs_and_records_success() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;

        let result: i32 = execute(
            Arc::clone(&state),
            ident("1"),
            StepConfig::new(),
            |_ctx| async { Ok(41 + 1) },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);

        let op = client.operation(&execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.result.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_replay_does_not_rerun_closure() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;
        let calls = Arc::new(AtomicU32::new(0));

        let run = |state: Arc<ExecutionState>, calls: Arc<AtomicU32>| async move {
            execute::<i32, _, _>(state, ident("1"), StepConfig::new(), move |_ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await
        };

        assert_eq!(run(Arc::clone(&state), Arc::clone(&calls)).await.unwrap(), 7);
        // Second invocation replays from history.
        let state2 = resumed_state(&client, &execution_id).await;
        assert_eq!(run(state2, Arc::clone(&calls)).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fenced_start_serves_recorded_result() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;
        let calls = Arc::new(AtomicU32::new(0));

        // A newer invocation takes over and completes the step.
        let takeover = client.start_invocation(&execution_id).await.unwrap();
        let started = client
            .update_state(
                &execution_id,
                &takeover.checkpoint_token,
                vec![OperationUpdate::start("1", OperationType::Step)],
            )
            .await
            .unwrap();
        client
            .update_state(
                &execution_id,
                &started.checkpoint_token,
                vec![OperationUpdate::succeed(
                    "1",
                    OperationType::Step,
                    Some("42".to_string()),
                )],
            )
            .await
            .unwrap();

        // The stale invocation's START is satisfied by the terminal
        // record; the stored result must be served, not a fresh run.
        let result: i32 = execute(
            state,
            ident("1"),
            StepConfig::new(),
            {
                let calls = Arc::clone(&calls);
                move |_ctx| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(99)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_attempt_schedules_retry_and_suspends() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;

        let result = execute::<i32, _, _>(state, ident("1"), StepConfig::new(), |_ctx| async {
            Err("transient".into())
        })
        .await;
        // Alone on the invocation, the backoff suspends.
        assert!(matches!(result, Err(EngineError::Suspended { .. })));

        let op = client.operation(&execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Ready);
        assert_eq!(op.attempt, 1);
        assert!(op.error.is_some());
    }

    #[tokio::test]
    async fn test_retry_resumes_on_next_invocation() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;
        let calls = Arc::new(AtomicU32::new(0));

        let make_closure = |calls: Arc<AtomicU32>| {
            move |ctx: StepContext| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt == 0 {
                        Err::<i32, BoxError>("flaky".into())
                    } else {
                        Ok(99)
                    }
                }
            }
        };

        let first = execute::<i32, _, _>(
            state,
            ident("1"),
            StepConfig::new(),
            make_closure(Arc::clone(&calls)),
        )
        .await;
        assert!(matches!(first, Err(EngineError::Suspended { .. })));

        // Backoff elapses, the next invocation re-runs from READY.
        client.advance_clock(6.0).await;
        let state2 = resumed_state(&client, &execution_id).await;
        let second = execute::<i32, _, _>(
            state2,
            ident("1"),
            StepConfig::new(),
            make_closure(Arc::clone(&calls)),
        )
        .await
        .unwrap();
        assert_eq!(second, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let op = client.operation(&execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.attempt, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_failure() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;

        let result = execute::<i32, _, _>(
            state,
            ident("1"),
            StepConfig::new().with_retry(RetryPolicy::none()),
            |_ctx| async { Err("fatal".into()) },
        )
        .await;
        assert!(matches!(result, Err(EngineError::UserCode { .. })));

        let op = client.operation(&execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.unwrap().error_message, "fatal");
    }

    #[tokio::test]
    async fn test_recorded_failure_replays_as_error() {
        let client = Arc::new(InMemoryCheckpointClient::new());
        let (execution_id, state) = fresh_state(&client).await;

        let _ = execute::<i32, _, _>(
            Arc::clone(&state),
            ident("1"),
            StepConfig::new().with_retry(RetryPolicy::none()),
            |_ctx| async { Err("fatal".into()) },
        )
        .await;

        let state2 = resumed_state(&client, &execution_id).await;
        let replayed = execute::<i32, _, _>(state2, ident("1"), StepConfig::new(), |_ctx| async {
            Ok(1)
        })
        .await;
        assert!(matches!(replayed, Err(EngineError::UserCode { .. })));
    }
}
