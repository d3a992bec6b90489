//! The suspend-or-race decision.
//!
//! A primitive that is blocked on an external resolution (a timer, a
//! callback, a downstream execution) calls [`await_progress`]. If nothing
//! else on this invocation is executing author code, the primitive yields
//! the suspension signal; callers that can still make progress without it
//! (race, any) park the signal, everything else propagates it until it
//! reaches the host boundary as the WAITING outcome. Otherwise the
//! primitive races three wake-up sources and loops: its own deadline
//! elapsing, all other work going idle, and a periodic backend re-poll
//! observing a status change.

use crate::duration::epoch_seconds;
use crate::error::EngineError;
use crate::state::ExecutionState;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL_MS: u64 = 100;

/// Sleeps until the given epoch deadline, or forever when there is none.
async fn sleep_until_deadline(deadline: Option<f64>) {
    match deadline {
        Some(end) => {
            let remaining = (end - epoch_seconds()).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
        }
        None => std::future::pending().await,
    }
}

/// Blocks until the operation may have made progress, or yields the
/// suspension signal when no other work is running.
///
/// Returns `Ok(())` when the caller should re-examine recorded state.
pub(crate) async fn await_progress(
    state: &Arc<ExecutionState>,
    operation_id: &str,
    scheduled_end: Option<f64>,
) -> Result<(), EngineError> {
    if state.running_count() == 0 {
        debug!(
            execution_id = %state.execution_id,
            operation_id = %operation_id,
            "no running operations, yielding suspension"
        );
        return Err(EngineError::Suspended {
            scheduled_end_timestamp: scheduled_end,
        });
    }

    let before = state
        .operation(operation_id)
        .await
        .map(|op| (op.status, op.attempt));

    tokio::select! {
        // Our own deadline elapsed; force a poll so maturation is observed.
        _ = sleep_until_deadline(scheduled_end) => {
            state.refresh().await?;
        }
        // Everything else went idle; the caller re-enters and suspends.
        _ = state.wait_for_idle() => {}
        // Periodic re-poll until this operation's recorded state moves.
        _ = async {
            loop {
                tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                if state.refresh().await.is_err() {
                    break;
                }
                let after = state
                    .operation(operation_id)
                    .await
                    .map(|op| (op.status, op.attempt));
                if after != before {
                    break;
                }
            }
        } => {}
    }
    Ok(())
}
