//! Checkpoint client contract and the in-memory backend.
//!
//! The engine talks to persistence exclusively through [`CheckpointClient`].
//! Every successful `update_state` rotates the checkpoint token; a call
//! made with a superseded token fails with a concurrency error, which is
//! how a fenced-out invocation discovers it has been superseded.
//!
//! [`InMemoryCheckpointClient`] is a complete local backend: it validates
//! updates against the transition table, rotates tokens, matures scheduled
//! waits on poll, and exposes the out-of-band callback API. It backs the
//! test suite and local development.

use crate::duration::epoch_seconds;
use crate::error::{EngineError, ErrorObject};
use crate::operation::{
    Operation, OperationAction, OperationStatus, OperationType, OperationUpdate,
};
use crate::transition;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Operations returned per poll page.
pub const PAGE_SIZE: usize = 100;

/// Response to starting a new execution.
#[derive(Debug, Clone)]
pub struct StartExecutionResponse {
    pub execution_id: String,
    pub invocation_id: String,
    pub checkpoint_token: String,
    pub operations: Vec<Operation>,
}

/// Response to starting a follow-up invocation of an existing execution.
#[derive(Debug, Clone)]
pub struct StartInvocationResponse {
    pub invocation_id: String,
    pub checkpoint_token: String,
}

/// Response to a state update: the rotated token plus the new state of
/// every operation the batch touched.
#[derive(Debug, Clone)]
pub struct UpdateStateResponse {
    pub checkpoint_token: String,
    pub operations: Vec<Operation>,
}

/// One page of execution history.
#[derive(Debug, Clone)]
pub struct PollStateResponse {
    pub operations: Vec<Operation>,
    pub next_marker: Option<String>,
}

/// Persistence boundary for checkpointed execution state.
#[async_trait]
pub trait CheckpointClient: Send + Sync {
    /// Creates a new execution with the given input payload.
    async fn start_execution(&self, input: Option<String>)
        -> Result<StartExecutionResponse, EngineError>;

    /// Registers a follow-up invocation and issues a fresh token,
    /// fencing out any invocation still holding the previous one.
    async fn start_invocation(
        &self,
        execution_id: &str,
    ) -> Result<StartInvocationResponse, EngineError>;

    /// Records the end of an invocation.
    async fn complete_invocation(
        &self,
        execution_id: &str,
        invocation_id: &str,
        error: Option<ErrorObject>,
    ) -> Result<(), EngineError>;

    /// Applies a batch of operation updates atomically.
    ///
    /// The whole batch is validated before any of it commits; one invalid
    /// update rejects the batch. A stale token fails with
    /// [`EngineError::Concurrency`].
    async fn update_state(
        &self,
        execution_id: &str,
        checkpoint_token: &str,
        updates: Vec<OperationUpdate>,
    ) -> Result<UpdateStateResponse, EngineError>;

    /// Reads one page of execution history.
    async fn poll_state(
        &self,
        execution_id: &str,
        marker: Option<String>,
    ) -> Result<PollStateResponse, EngineError>;

    /// Completes a callback successfully, out of band.
    async fn complete_callback(
        &self,
        callback_id: &str,
        payload: Option<String>,
    ) -> Result<(), EngineError>;

    /// Fails a callback, out of band.
    async fn fail_callback(&self, callback_id: &str, error: ErrorObject)
        -> Result<(), EngineError>;

    /// Refreshes a callback's heartbeat deadline.
    async fn heartbeat_callback(&self, callback_id: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Default)]
struct CallbackMeta {
    heartbeat_seconds: Option<u64>,
    heartbeat_deadline: Option<f64>,
}

#[derive(Debug, Default)]
struct ExecutionRecord {
    operations: HashMap<String, Operation>,
    /// Insertion order, for stable paging
    order: Vec<String>,
    token: String,
    input: Option<String>,
    active_invocations: Vec<String>,
    completed_invocations: Vec<String>,
    callbacks: HashMap<String, CallbackMeta>,
}

impl ExecutionRecord {
    fn insert(&mut self, op: Operation) {
        if !self.operations.contains_key(&op.operation_id) {
            self.order.push(op.operation_id.clone());
        }
        self.operations.insert(op.operation_id.clone(), op);
    }
}

#[derive(Debug, Default)]
struct BackendInner {
    executions: HashMap<String, ExecutionRecord>,
    /// callback_id -> (execution_id, operation_id)
    callback_index: HashMap<String, (String, String)>,
    execution_counter: u64,
    invocation_counter: u64,
    token_counter: u64,
    callback_counter: u64,
    /// Simulated clock offset for tests
    clock_skew: f64,
}

impl BackendInner {
    fn now(&self) -> f64 {
        epoch_seconds() + self.clock_skew
    }

    fn next_token(&mut self) -> String {
        self.token_counter += 1;
        format!("tok-{}", self.token_counter)
    }

    fn next_invocation(&mut self) -> String {
        self.invocation_counter += 1;
        format!("inv-{}", self.invocation_counter)
    }

    fn execution_mut(&mut self, execution_id: &str) -> Result<&mut ExecutionRecord, EngineError> {
        self.executions
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::backend(format!("unknown execution {execution_id}")))
    }

    /// Resolves scheduled operations whose deadlines have passed.
    fn mature(&mut self, execution_id: &str) {
        let now = self.now();
        let Some(record) = self.executions.get_mut(execution_id) else {
            return;
        };
        let mut expired_callbacks = Vec::new();
        for op in record.operations.values_mut() {
            if op.status != OperationStatus::Started {
                continue;
            }
            match op.operation_type {
                OperationType::Wait => {
                    if let Some(end) = op.scheduled_end_timestamp {
                        if now >= end {
                            op.status = OperationStatus::Succeeded;
                            op.end_timestamp = Some(end);
                        }
                    }
                }
                OperationType::Callback => {
                    let timeout_passed = op
                        .scheduled_end_timestamp
                        .map(|end| now >= end)
                        .unwrap_or(false);
                    let heartbeat_passed = op
                        .callback_id
                        .as_ref()
                        .and_then(|id| record.callbacks.get(id))
                        .and_then(|meta| meta.heartbeat_deadline)
                        .map(|deadline| now >= deadline)
                        .unwrap_or(false);
                    if timeout_passed || heartbeat_passed {
                        op.status = OperationStatus::TimedOut;
                        op.end_timestamp = Some(now);
                        op.error = Some(ErrorObject::new(
                            "CallbackTimedOut",
                            if heartbeat_passed && !timeout_passed {
                                "callback heartbeat deadline elapsed"
                            } else {
                                "callback timed out"
                            },
                        ));
                        if let Some(id) = &op.callback_id {
                            expired_callbacks.push(id.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        for id in expired_callbacks {
            record.callbacks.remove(&id);
        }
    }

    fn resolve_callback(
        &mut self,
        callback_id: &str,
        status: OperationStatus,
        payload: Option<String>,
        error: Option<ErrorObject>,
    ) -> Result<(), EngineError> {
        let (execution_id, operation_id) = self
            .callback_index
            .get(callback_id)
            .cloned()
            .ok_or_else(|| EngineError::Callback {
                message: format!("unknown callback {callback_id}"),
                callback_id: Some(callback_id.to_string()),
            })?;
        let now = self.now();
        let record = self.execution_mut(&execution_id)?;
        let op = record
            .operations
            .get_mut(&operation_id)
            .ok_or_else(|| EngineError::backend(format!("missing operation {operation_id}")))?;
        if op.status.is_terminal() {
            return Err(EngineError::Callback {
                message: format!("callback {callback_id} already resolved"),
                callback_id: Some(callback_id.to_string()),
            });
        }
        op.status = status;
        op.result = payload;
        op.error = error;
        op.end_timestamp = Some(now);
        record.callbacks.remove(callback_id);
        Ok(())
    }
}

/// Local checkpoint backend holding all state in memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointClient {
    inner: Mutex<BackendInner>,
}

impl InMemoryCheckpointClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shifts the backend's clock forward, maturing timers without real
    /// waiting. Test-only convenience.
    pub async fn advance_clock(&self, seconds: f64) {
        let mut inner = self.inner.lock().await;
        inner.clock_skew += seconds;
    }

    /// Snapshot of one operation's recorded state.
    pub async fn operation(&self, execution_id: &str, operation_id: &str) -> Option<Operation> {
        let inner = self.inner.lock().await;
        inner
            .executions
            .get(execution_id)
            .and_then(|r| r.operations.get(operation_id))
            .cloned()
    }

    /// Snapshot of the full history in insertion order.
    pub async fn history(&self, execution_id: &str) -> Vec<Operation> {
        let inner = self.inner.lock().await;
        inner
            .executions
            .get(execution_id)
            .map(|r| {
                r.order
                    .iter()
                    .filter_map(|id| r.operations.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Externally cancels a started operation, as a console or operator
    /// API would.
    pub async fn cancel_operation(
        &self,
        execution_id: &str,
        operation_id: &str,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let record = inner.execution_mut(execution_id)?;
        let op = record
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| EngineError::backend(format!("missing operation {operation_id}")))?;
        if op.status != OperationStatus::Started {
            return Err(EngineError::backend(format!(
                "operation {operation_id} is not started"
            )));
        }
        op.status = OperationStatus::Cancelled;
        op.end_timestamp = Some(now);
        Ok(())
    }

    /// Resolves a chained invoke successfully, standing in for the
    /// downstream execution completing.
    pub async fn complete_chained_invoke(
        &self,
        execution_id: &str,
        operation_id: &str,
        payload: Option<String>,
    ) -> Result<(), EngineError> {
        self.resolve_invoke(execution_id, operation_id, OperationStatus::Succeeded, payload, None)
            .await
    }

    /// Resolves a chained invoke with a failure.
    pub async fn fail_chained_invoke(
        &self,
        execution_id: &str,
        operation_id: &str,
        error: ErrorObject,
    ) -> Result<(), EngineError> {
        self.resolve_invoke(
            execution_id,
            operation_id,
            OperationStatus::Failed,
            None,
            Some(error),
        )
        .await
    }

    async fn resolve_invoke(
        &self,
        execution_id: &str,
        operation_id: &str,
        status: OperationStatus,
        payload: Option<String>,
        error: Option<ErrorObject>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let record = inner.execution_mut(execution_id)?;
        let op = record
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| EngineError::backend(format!("missing operation {operation_id}")))?;
        if op.operation_type != OperationType::ChainedInvoke {
            return Err(EngineError::backend(format!(
                "operation {operation_id} is not a chained invoke"
            )));
        }
        op.status = status;
        op.result = payload;
        op.error = error;
        op.end_timestamp = Some(now);
        Ok(())
    }
}

#[async_trait]
impl CheckpointClient for InMemoryCheckpointClient {
    async fn start_execution(
        &self,
        input: Option<String>,
    ) -> Result<StartExecutionResponse, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.execution_counter += 1;
        let execution_id = format!("exec-{}", inner.execution_counter);
        let invocation_id = inner.next_invocation();
        let token = inner.next_token();
        let now = inner.now();

        let mut record = ExecutionRecord {
            token: token.clone(),
            input: input.clone(),
            ..Default::default()
        };
        let mut root = Operation::new("0", OperationType::Execution, OperationStatus::Started);
        root.start_timestamp = Some(now);
        root.result = input;
        record.insert(root.clone());
        record.active_invocations.push(invocation_id.clone());
        inner.executions.insert(execution_id.clone(), record);

        debug!(execution_id = %execution_id, "started execution");
        Ok(StartExecutionResponse {
            execution_id,
            invocation_id,
            checkpoint_token: token,
            operations: vec![root],
        })
    }

    async fn start_invocation(
        &self,
        execution_id: &str,
    ) -> Result<StartInvocationResponse, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.mature(execution_id);
        let invocation_id = inner.next_invocation();
        let token = inner.next_token();
        let record = inner.execution_mut(execution_id)?;
        record.token = token.clone();
        record.active_invocations.push(invocation_id.clone());
        Ok(StartInvocationResponse {
            invocation_id,
            checkpoint_token: token,
        })
    }

    async fn complete_invocation(
        &self,
        execution_id: &str,
        invocation_id: &str,
        _error: Option<ErrorObject>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let record = inner.execution_mut(execution_id)?;
        record.active_invocations.retain(|id| id != invocation_id);
        record.completed_invocations.push(invocation_id.to_string());
        Ok(())
    }

    async fn update_state(
        &self,
        execution_id: &str,
        checkpoint_token: &str,
        updates: Vec<OperationUpdate>,
    ) -> Result<UpdateStateResponse, EngineError> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let record = inner.execution_mut(execution_id)?;
        if record.token != checkpoint_token {
            return Err(EngineError::concurrency(format!(
                "checkpoint token superseded for execution {execution_id}"
            )));
        }

        // Validate the whole batch against a staging copy before any of it
        // commits; updates within a batch see earlier updates' effects.
        let mut staged: HashMap<String, Operation> = HashMap::new();
        for update in &updates {
            let prior = staged
                .get(&update.operation_id)
                .or_else(|| record.operations.get(&update.operation_id));
            let applied = transition::apply(prior, update, now)?;
            staged.insert(applied.operation_id.clone(), applied);
        }

        // Assign backend-issued callback ids to new callback starts.
        let mut new_callbacks = Vec::new();
        for update in &updates {
            if update.operation_type == OperationType::Callback
                && update.action == OperationAction::Start
            {
                let Some(op) = staged.get_mut(&update.operation_id) else {
                    continue;
                };
                if op.callback_id.is_some() {
                    continue;
                }
                inner.callback_counter += 1;
                let callback_id = format!("cb-{}", inner.callback_counter);
                op.callback_id = Some(callback_id.clone());
                let heartbeat_seconds = update
                    .callback_options
                    .as_ref()
                    .and_then(|c| c.heartbeat_timeout_seconds);
                let meta = CallbackMeta {
                    heartbeat_seconds,
                    heartbeat_deadline: heartbeat_seconds.map(|s| now + s as f64),
                };
                inner.callback_index.insert(
                    callback_id.clone(),
                    (execution_id.to_string(), update.operation_id.clone()),
                );
                new_callbacks.push((callback_id, meta));
            }
        }

        // Commit and rotate the token.
        let token = inner.next_token();
        let record = inner.execution_mut(execution_id)?;
        for (callback_id, meta) in new_callbacks {
            record.callbacks.insert(callback_id, meta);
        }
        for update in &updates {
            if let Some(op) = staged.get(&update.operation_id) {
                record.insert(op.clone());
            }
        }
        let mut result_ops: Vec<Operation> = updates
            .iter()
            .filter_map(|u| record.operations.get(&u.operation_id).cloned())
            .collect();
        result_ops.dedup_by(|a, b| a.operation_id == b.operation_id);
        record.token = token.clone();

        debug!(
            execution_id = %execution_id,
            updates = updates.len(),
            "committed state update"
        );
        Ok(UpdateStateResponse {
            checkpoint_token: token,
            operations: result_ops,
        })
    }

    async fn poll_state(
        &self,
        execution_id: &str,
        marker: Option<String>,
    ) -> Result<PollStateResponse, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.mature(execution_id);
        let record = inner
            .executions
            .get(execution_id)
            .ok_or_else(|| EngineError::backend(format!("unknown execution {execution_id}")))?;

        let offset = match marker {
            Some(m) => m
                .parse::<usize>()
                .map_err(|_| EngineError::backend(format!("bad poll marker {m}")))?,
            None => 0,
        };
        let page: Vec<Operation> = record
            .order
            .iter()
            .skip(offset)
            .take(PAGE_SIZE)
            .filter_map(|id| record.operations.get(id))
            .cloned()
            .collect();
        let next_marker = if offset + page.len() < record.order.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok(PollStateResponse {
            operations: page,
            next_marker,
        })
    }

    async fn complete_callback(
        &self,
        callback_id: &str,
        payload: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.resolve_callback(callback_id, OperationStatus::Succeeded, payload, None)
    }

    async fn fail_callback(
        &self,
        callback_id: &str,
        error: ErrorObject,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.resolve_callback(callback_id, OperationStatus::Failed, None, Some(error))
    }

    async fn heartbeat_callback(&self, callback_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let (execution_id, _) = inner
            .callback_index
            .get(callback_id)
            .cloned()
            .ok_or_else(|| EngineError::Callback {
                message: format!("unknown callback {callback_id}"),
                callback_id: Some(callback_id.to_string()),
            })?;
        let record = inner.execution_mut(&execution_id)?;
        let meta = record
            .callbacks
            .get_mut(callback_id)
            .ok_or_else(|| EngineError::Callback {
                message: format!("callback {callback_id} already resolved"),
                callback_id: Some(callback_id.to_string()),
            })?;
        if let Some(seconds) = meta.heartbeat_seconds {
            meta.heartbeat_deadline = Some(now + seconds as f64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::CallbackOptions;

    #[tokio::test]
    async fn test_start_execution_creates_root() {
        let client = InMemoryCheckpointClient::new();
        let resp = client
            .start_execution(Some("\"input\"".to_string()))
            .await
            .unwrap();
        assert_eq!(resp.operations.len(), 1);
        assert_eq!(resp.operations[0].operation_id, "0");
        assert_eq!(resp.operations[0].operation_type, OperationType::Execution);
    }

    #[tokio::test]
    async fn test_stale_token_rejected() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();
        let old_token = resp.checkpoint_token.clone();

        let update = OperationUpdate::start("1", OperationType::Step);
        let fresh = client
            .update_state(&resp.execution_id, &old_token, vec![update.clone()])
            .await
            .unwrap();
        assert_ne!(fresh.checkpoint_token, old_token);

        let result = client
            .update_state(&resp.execution_id, &old_token, vec![update])
            .await;
        assert!(matches!(result, Err(EngineError::Concurrency { .. })));
    }

    #[tokio::test]
    async fn test_invalid_batch_rejected_atomically() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();

        // Second update is illegal (SUCCEED on an operation that never
        // started), so the first must not commit either.
        let updates = vec![
            OperationUpdate::start("1", OperationType::Step),
            OperationUpdate::succeed("2", OperationType::Step, None),
        ];
        let result = client
            .update_state(&resp.execution_id, &resp.checkpoint_token, updates)
            .await;
        assert!(matches!(result, Err(EngineError::Validation { .. })));
        assert!(client.operation(&resp.execution_id, "1").await.is_none());

        // And the token was not burned.
        let ok = client
            .update_state(
                &resp.execution_id,
                &resp.checkpoint_token,
                vec![OperationUpdate::start("1", OperationType::Step)],
            )
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_wait_matures_on_poll() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();
        let update = OperationUpdate::start("1", OperationType::Wait).with_wait_options(
            crate::operation::WaitOptions {
                wait_seconds: Some(60),
                until_timestamp: None,
            },
        );
        client
            .update_state(&resp.execution_id, &resp.checkpoint_token, vec![update])
            .await
            .unwrap();

        let page = client.poll_state(&resp.execution_id, None).await.unwrap();
        let wait = page.operations.iter().find(|o| o.operation_id == "1").unwrap();
        assert_eq!(wait.status, OperationStatus::Started);

        client.advance_clock(61.0).await;
        let page = client.poll_state(&resp.execution_id, None).await.unwrap();
        let wait = page.operations.iter().find(|o| o.operation_id == "1").unwrap();
        assert_eq!(wait.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_callback_assigned_id_and_completed_once() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();
        let update = OperationUpdate::start("1", OperationType::Callback)
            .with_callback_options(CallbackOptions {
                timeout_seconds: Some(300),
                heartbeat_timeout_seconds: None,
            });
        let committed = client
            .update_state(&resp.execution_id, &resp.checkpoint_token, vec![update])
            .await
            .unwrap();
        let callback_id = committed.operations[0].callback_id.clone().unwrap();

        client
            .complete_callback(&callback_id, Some("\"done\"".to_string()))
            .await
            .unwrap();
        let op = client.operation(&resp.execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.result.as_deref(), Some("\"done\""));

        // Exactly-once: a second completion is rejected.
        let again = client.complete_callback(&callback_id, None).await;
        assert!(matches!(again, Err(EngineError::Callback { .. })));
    }

    #[tokio::test]
    async fn test_callback_heartbeat_timeout() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();
        let update = OperationUpdate::start("1", OperationType::Callback)
            .with_callback_options(CallbackOptions {
                timeout_seconds: Some(3600),
                heartbeat_timeout_seconds: Some(30),
            });
        let committed = client
            .update_state(&resp.execution_id, &resp.checkpoint_token, vec![update])
            .await
            .unwrap();
        let callback_id = committed.operations[0].callback_id.clone().unwrap();

        // Heartbeats keep it alive.
        client.advance_clock(25.0).await;
        client.heartbeat_callback(&callback_id).await.unwrap();
        client.advance_clock(25.0).await;
        client.poll_state(&resp.execution_id, None).await.unwrap();
        let op = client.operation(&resp.execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Started);

        // Then silence past the deadline times it out.
        client.advance_clock(31.0).await;
        client.poll_state(&resp.execution_id, None).await.unwrap();
        let op = client.operation(&resp.execution_id, "1").await.unwrap();
        assert_eq!(op.status, OperationStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_poll_pagination() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();
        let mut token = resp.checkpoint_token.clone();
        for i in 1..=(PAGE_SIZE + 10) {
            let update = OperationUpdate::start(i.to_string(), OperationType::Step);
            let committed = client
                .update_state(&resp.execution_id, &token, vec![update])
                .await
                .unwrap();
            token = committed.checkpoint_token;
        }

        let first = client.poll_state(&resp.execution_id, None).await.unwrap();
        assert_eq!(first.operations.len(), PAGE_SIZE);
        let marker = first.next_marker.clone().unwrap();
        let second = client
            .poll_state(&resp.execution_id, Some(marker))
            .await
            .unwrap();
        // Root EXECUTION op plus 110 steps, minus the first page.
        assert_eq!(second.operations.len(), PAGE_SIZE + 11 - PAGE_SIZE);
        assert!(second.next_marker.is_none());
    }

    #[tokio::test]
    async fn test_start_invocation_rotates_token() {
        let client = InMemoryCheckpointClient::new();
        let resp = client.start_execution(None).await.unwrap();
        let second = client.start_invocation(&resp.execution_id).await.unwrap();
        assert_ne!(second.checkpoint_token, resp.checkpoint_token);

        let stale = client
            .update_state(
                &resp.execution_id,
                &resp.checkpoint_token,
                vec![OperationUpdate::start("1", OperationType::Step)],
            )
            .await;
        assert!(matches!(stale, Err(EngineError::Concurrency { .. })));
    }
}
