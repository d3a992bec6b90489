//! Durable timers.
//!
//! The backend owns maturation: a started wait becomes SUCCEEDED once its
//! scheduled end passes, observed on poll. The handler trusts the recorded
//! status and uses the local clock only to decide when to re-poll.

use crate::context::OperationIdentifier;
use crate::duration::epoch_seconds;
use crate::error::EngineError;
use crate::handlers::expect_type;
use crate::operation::{OperationStatus, OperationType, OperationUpdate, WaitOptions};
use crate::state::ExecutionState;
use crate::suspension::await_progress;
use std::sync::Arc;
use tracing::debug;

/// What a wait is waiting for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitTarget {
    Seconds(u64),
    Until(f64),
}

pub(crate) async fn execute(
    state: Arc<ExecutionState>,
    ident: OperationIdentifier,
    target: WaitTarget,
) -> Result<(), EngineError> {
    if let WaitTarget::Seconds(seconds) = target {
        if seconds < 1 {
            return Err(EngineError::execution(
                "wait duration must be at least one second",
            ));
        }
    }

    let operation_id = ident.operation_id.clone();
    let mut polled_past_deadline = false;
    loop {
        match state.operation(&operation_id).await {
            None => {
                let options = match target {
                    WaitTarget::Seconds(seconds) => WaitOptions {
                        wait_seconds: Some(seconds),
                        until_timestamp: None,
                    },
                    WaitTarget::Until(timestamp) => WaitOptions {
                        wait_seconds: None,
                        until_timestamp: Some(timestamp),
                    },
                };
                let mut update = OperationUpdate::start(&operation_id, OperationType::Wait)
                    .with_wait_options(options);
                update.parent_id = ident.parent_id.clone();
                update.name = ident.name.clone();
                state.checkpoint(update).await?;
            }
            Some(op) => {
                expect_type(&op, OperationType::Wait)?;
                match op.status {
                    OperationStatus::Succeeded => {
                        debug!(
                            execution_id = %state.execution_id,
                            operation_id = %operation_id,
                            replayed = true,
                            "wait already elapsed"
                        );
                        return Ok(());
                    }
                    OperationStatus::Cancelled => {
                        return Err(EngineError::execution(format!(
                            "wait {operation_id} was cancelled"
                        )));
                    }
                    OperationStatus::Failed
                    | OperationStatus::Stopped
                    | OperationStatus::TimedOut => {
                        return Err(EngineError::execution(format!(
                            "wait {operation_id} ended as {:?}",
                            op.status
                        )));
                    }
                    OperationStatus::Started | OperationStatus::Ready => {
                        let deadline = op.scheduled_end_timestamp;
                        let passed =
                            deadline.map(|end| epoch_seconds() >= end).unwrap_or(false);
                        if passed && !polled_past_deadline {
                            // Deadline passed locally; poll once so the
                            // backend's maturation becomes visible.
                            polled_past_deadline = true;
                            state.refresh().await?;
                        } else {
                            // A passed deadline that survived the poll means
                            // clock skew; fall back to the periodic re-poll.
                            let effective = if passed { None } else { deadline };
                            await_progress(&state, &operation_id, effective).await?;
                        }
                    }
                }
            }
        }
    }
}
