//! Shared per-invocation execution state.
//!
//! Holds the replayed history, the rotating checkpoint token, and the
//! running-operation accounting the suspension protocol depends on.
//! Checkpoint writes are single-flight: the token lives inside an async
//! mutex, so concurrent primitives serialize their updates and each one
//! observes the token its predecessor received.

use crate::client::CheckpointClient;
use crate::error::{EngineError, ErrorObject, TerminationReason};
use crate::operation::{Operation, OperationAction, OperationStatus, OperationType, OperationUpdate};
use crate::termination::TerminationCoordinator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

/// Execution-scoped state shared by every primitive of one invocation.
pub struct ExecutionState {
    pub execution_id: String,
    client: Arc<dyn CheckpointClient>,
    operations: RwLock<HashMap<String, Operation>>,
    /// Current checkpoint token; the lock serializes update_state calls.
    token: Mutex<String>,
    /// Operations currently executing author code
    running: AtomicUsize,
    idle_notify: Notify,
    context_tokens: AtomicU64,
    input: Option<String>,
    /// Fired when this invocation is fenced out by a newer one, so the
    /// host ends it even if author code swallows the suspension signal.
    coordinator: OnceLock<Arc<TerminationCoordinator>>,
}

impl ExecutionState {
    pub fn new(
        client: Arc<dyn CheckpointClient>,
        execution_id: impl Into<String>,
        checkpoint_token: impl Into<String>,
        initial_operations: Vec<Operation>,
        input: Option<String>,
    ) -> Arc<Self> {
        let operations = initial_operations
            .into_iter()
            .map(|op| (op.operation_id.clone(), op))
            .collect();
        Arc::new(Self {
            execution_id: execution_id.into(),
            client,
            operations: RwLock::new(operations),
            token: Mutex::new(checkpoint_token.into()),
            running: AtomicUsize::new(0),
            idle_notify: Notify::new(),
            context_tokens: AtomicU64::new(1),
            input,
            coordinator: OnceLock::new(),
        })
    }

    /// Registers the invocation's termination coordinator.
    pub fn attach_coordinator(&self, coordinator: Arc<TerminationCoordinator>) {
        let _ = self.coordinator.set(coordinator);
    }

    /// The execution's original input payload.
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// Looks up the recorded state of one operation.
    pub async fn operation(&self, operation_id: &str) -> Option<Operation> {
        self.operations.read().await.get(operation_id).cloned()
    }

    /// Applies one update through the backend and merges the result.
    ///
    /// A stale-token rejection means another invocation has taken over this
    /// execution. The history is re-polled; if it shows the update's effect
    /// already recorded the call succeeds against that record, otherwise
    /// this invocation is fenced out and the suspension signal is returned.
    /// Concurrency errors never escape to author code.
    pub async fn checkpoint(&self, update: OperationUpdate) -> Result<Operation, EngineError> {
        let mut token = self.token.lock().await;
        let result = self
            .client
            .update_state(&self.execution_id, &token, vec![update.clone()])
            .await;
        match result {
            Ok(response) => {
                *token = response.checkpoint_token.clone();
                drop(token);
                let mut committed = None;
                {
                    let mut operations = self.operations.write().await;
                    for op in response.operations {
                        if op.operation_id == update.operation_id {
                            committed = Some(op.clone());
                        }
                        operations.insert(op.operation_id.clone(), op);
                    }
                }
                committed.ok_or_else(|| {
                    EngineError::backend("backend did not return the updated operation")
                })
            }
            Err(err) if err.is_concurrency() => {
                drop(token);
                warn!(
                    execution_id = %self.execution_id,
                    operation_id = %update.operation_id,
                    "checkpoint token superseded, re-polling"
                );
                self.refresh().await?;
                let recorded = self.operation(&update.operation_id).await;
                if let Some(op) = recorded {
                    if update_already_satisfied(&update, &op) {
                        return Ok(op);
                    }
                }
                if let Some(coordinator) = self.coordinator.get() {
                    coordinator.terminate(
                        TerminationReason::WaitingForEvent,
                        "checkpoint token superseded by a newer invocation",
                    );
                }
                Err(EngineError::suspended())
            }
            Err(err) => Err(err),
        }
    }

    /// Re-reads the full history from the backend.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let mut all = HashMap::new();
        let mut marker = None;
        loop {
            let page = self.client.poll_state(&self.execution_id, marker).await?;
            for op in page.operations {
                all.insert(op.operation_id.clone(), op);
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        *self.operations.write().await = all;
        Ok(())
    }

    /// Marks an operation as actively executing author code until the
    /// returned guard is dropped.
    pub fn begin_work(self: &Arc<Self>) -> WorkGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            state: Arc::clone(self),
        }
    }

    /// How many operations are executing author code right now.
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves once no operation is executing author code.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.running_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Completes the root execution record successfully.
    pub async fn complete_execution_success(
        &self,
        payload: Option<String>,
    ) -> Result<(), EngineError> {
        let update = OperationUpdate::succeed("0", OperationType::Execution, payload);
        self.checkpoint(update).await?;
        debug!(execution_id = %self.execution_id, "execution succeeded");
        Ok(())
    }

    /// Completes the root execution record with a failure.
    pub async fn complete_execution_failure(&self, error: ErrorObject) -> Result<(), EngineError> {
        let update = OperationUpdate::fail("0", OperationType::Execution, error);
        self.checkpoint(update).await?;
        debug!(execution_id = %self.execution_id, "execution failed");
        Ok(())
    }

    /// Issues a unique scope token for a new context value.
    pub fn allocate_context_token(&self) -> u64 {
        self.context_tokens.fetch_add(1, Ordering::Relaxed)
    }
}

/// Whether the recorded operation already reflects the requested action,
/// meaning a superseding invocation made the same transition.
fn update_already_satisfied(update: &OperationUpdate, op: &Operation) -> bool {
    match update.action {
        OperationAction::Start => !matches!(op.status, OperationStatus::Ready) || op.start_timestamp.is_some(),
        OperationAction::Succeed => op.status == OperationStatus::Succeeded,
        OperationAction::Fail => op.status == OperationStatus::Failed,
        OperationAction::Cancel => op.status == OperationStatus::Cancelled,
        OperationAction::Retry => op.status == OperationStatus::Ready && op.attempt > 0,
    }
}

/// RAII marker for an operation executing author code.
pub struct WorkGuard {
    state: Arc<ExecutionState>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.state.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle_notify.notify_waiters();
        }
    }
}
