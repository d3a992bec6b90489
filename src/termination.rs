//! One-shot termination signal for an invocation.
//!
//! The coordinator fires exactly once; later calls are no-ops. It is the
//! backstop for ending an invocation out from under author code: a fenced
//! checkpoint token fires it, and operators can fire it directly. The host
//! driver races author code against
//! [`TerminationCoordinator::terminated`].

use crate::error::TerminationReason;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

/// The recorded termination decision.
#[derive(Debug, Clone)]
pub struct Termination {
    pub reason: TerminationReason,
    pub message: String,
}

/// Coordinates ending an invocation early, first call wins.
pub struct TerminationCoordinator {
    fired: AtomicBool,
    sender: watch::Sender<Option<Termination>>,
    receiver: watch::Receiver<Option<Termination>>,
}

impl Default for TerminationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationCoordinator {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self {
            fired: AtomicBool::new(false),
            sender,
            receiver,
        }
    }

    /// Fires the termination signal. Only the first call has any effect.
    pub fn terminate(&self, reason: TerminationReason, message: impl Into<String>) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let termination = Termination {
            reason,
            message: message.into(),
        };
        debug!(?reason, message = %termination.message, "invocation terminating");
        // Receiver is held by self, send cannot fail.
        let _ = self.sender.send(Some(termination));
    }

    /// Runs a cleanup closure then fires the signal. Cleanup failures are
    /// logged and do not block termination.
    pub fn terminate_with_cleanup<F>(
        &self,
        reason: TerminationReason,
        message: impl Into<String>,
        cleanup: F,
    ) where
        F: FnOnce() -> Result<(), String>,
    {
        if let Err(error) = cleanup() {
            warn!(%error, "termination cleanup failed");
        }
        self.terminate(reason, message);
    }

    /// Whether the signal has fired.
    pub fn is_terminated(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves with the termination decision once the signal fires.
    pub async fn terminated(&self) -> Termination {
        let mut receiver = self.receiver.clone();
        loop {
            {
                let current = receiver.borrow_and_update();
                if let Some(termination) = current.as_ref() {
                    return termination.clone();
                }
            }
            if receiver.changed().await.is_err() {
                // Sender dropped without firing; park forever, the host
                // driver's other race branch decides the outcome.
                std::future::pending::<()>().await;
            }
        }
    }
}
