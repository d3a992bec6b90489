//! # durafn
//!
//! A replay-based durable execution engine for short-lived, interruptible
//! hosts. A durable function is ordinary async Rust; the engine records
//! each operation (steps, timers, callbacks, child invocations) in
//! checkpointed history, and when the host is re-invoked the function
//! runs again from the top with completed operations replayed from
//! history instead of re-executed. Authors cannot tell a continuation
//! apart from a first run.
//!
//! ```no_run
//! use durafn::{run_invocation, Duration, EngineError, ExecutionContext};
//!
//! async fn order_flow(ctx: ExecutionContext) -> Result<String, EngineError> {
//!     let order_id: String = ctx
//!         .step(Some("reserve"), |_| async { Ok("order-17".to_string()) })
//!         .await?;
//!     ctx.wait(Some("cooling-off"), Duration::from_hours(24)).await?;
//!     ctx.step(Some("charge"), move |_| {
//!         let order_id = order_id.clone();
//!         async move { Ok(format!("charged {order_id}")) }
//!     })
//!     .await
//! }
//! ```
//!
//! Persistence is reached only through the [`CheckpointClient`] trait;
//! [`InMemoryCheckpointClient`] is a complete local backend for tests and
//! development.

mod client;
mod config;
mod context;
mod duration;
mod error;
mod handlers;
mod host;
mod operation;
mod retry;
mod state;
mod suspension;
mod termination;
mod tracker;
mod transition;

pub use client::{
    CheckpointClient, InMemoryCheckpointClient, PollStateResponse, StartExecutionResponse,
    StartInvocationResponse, UpdateStateResponse, PAGE_SIZE,
};
pub use config::{CallbackConfig, InvokeConfig, MapConfig, StepConfig};
pub use context::{BoxedOperation, BranchFn, ExecutionContext, OperationIdentifier};
pub use duration::{epoch_seconds, Duration};
pub use error::{EngineError, ErrorObject, TerminationReason};
pub use handlers::callback::CallbackHandle;
pub use handlers::combinators::SettledOutcome;
pub use handlers::step::StepContext;
pub use handlers::BoxError;
pub use host::{run_invocation, InvocationRequest, InvocationResponse, InvocationStatus};
pub use operation::{
    CallbackOptions, InvokeOptions, Operation, OperationAction, OperationStatus, OperationType,
    OperationUpdate, RetryOptions, WaitOptions,
};
pub use retry::{decide, decide_with, ErrorMatcher, Jitter, RetryDecision, RetryPolicy};
pub use state::ExecutionState;
pub use termination::{Termination, TerminationCoordinator};
pub use tracker::InvocationTracker;
pub use transition::{apply, validate};
