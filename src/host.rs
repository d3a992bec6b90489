//! Host invocation contract.
//!
//! The host hands each invocation a request carrying the execution id,
//! checkpoint token, and initial operation page; [`run_invocation`] drives
//! the durable function and reports one of three outcomes: SUCCEEDED,
//! FAILED, or WAITING. WAITING means the execution is alive but blocked;
//! the backend will invoke again when forward progress is possible.

use crate::client::CheckpointClient;
use crate::context::ExecutionContext;
use crate::error::{EngineError, ErrorObject};
use crate::handlers::serialize_payload;
use crate::operation::Operation;
use crate::state::ExecutionState;
use crate::termination::TerminationCoordinator;
use crate::tracker::InvocationTracker;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// One invocation of a durable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(rename = "ExecutionId")]
    pub execution_id: String,
    #[serde(rename = "InvocationId")]
    pub invocation_id: String,
    #[serde(rename = "CheckpointToken")]
    pub checkpoint_token: String,
    /// First page of recorded history; the engine polls for the rest.
    #[serde(rename = "Operations", default)]
    pub initial_operations: Vec<Operation>,
    /// The execution's original input payload
    #[serde(rename = "Input", skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

/// Terminal status of one invocation. WAITING is a normal outcome, not a
/// failure: the execution continues on a later invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "WAITING")]
    Waiting,
}

/// What the host reports back to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "Status")]
    pub status: InvocationStatus,
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl InvocationResponse {
    pub fn succeeded(result: Option<String>) -> Self {
        Self {
            status: InvocationStatus::Succeeded,
            result,
            error: None,
        }
    }

    pub fn failed(error: ErrorObject) -> Self {
        Self {
            status: InvocationStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    pub fn waiting() -> Self {
        Self {
            status: InvocationStatus::Waiting,
            result: None,
            error: None,
        }
    }
}

enum HandlerOutcome<T> {
    Finished(Result<T, EngineError>),
    Terminated,
}

/// Drives one invocation of a durable function to its SUCCEEDED, FAILED,
/// or WAITING outcome.
pub async fn run_invocation<F, Fut, T>(
    client: Arc<dyn CheckpointClient>,
    tracker: Arc<InvocationTracker>,
    request: InvocationRequest,
    handler: F,
) -> InvocationResponse
where
    F: FnOnce(ExecutionContext) -> Fut + Send,
    Fut: Future<Output = Result<T, EngineError>> + Send,
    T: Serialize,
{
    // Registered before the first await; there is no window in which the
    // invocation runs untracked.
    tracker.register(&request.invocation_id);

    let state = ExecutionState::new(
        Arc::clone(&client),
        request.execution_id.clone(),
        request.checkpoint_token.clone(),
        request.initial_operations.clone(),
        request.input.clone(),
    );
    let coordinator = Arc::new(TerminationCoordinator::new());
    state.attach_coordinator(Arc::clone(&coordinator));
    let context = ExecutionContext::root(Arc::clone(&state));

    let run = handler(context);
    tokio::pin!(run);
    let outcome = tokio::select! {
        result = &mut run => HandlerOutcome::Finished(result),
        _termination = coordinator.terminated() => HandlerOutcome::Terminated,
    };

    let response = match outcome {
        HandlerOutcome::Finished(Ok(value)) => match serialize_payload(&value) {
            Ok(payload) => match state.complete_execution_success(Some(payload.clone())).await {
                Ok(()) => InvocationResponse::succeeded(Some(payload)),
                Err(error) if error.is_suspended() => InvocationResponse::waiting(),
                Err(error) => InvocationResponse::failed(ErrorObject::from(&error)),
            },
            Err(error) => {
                let error_object = ErrorObject::from(&error);
                let _ = state.complete_execution_failure(error_object.clone()).await;
                InvocationResponse::failed(error_object)
            }
        },
        HandlerOutcome::Finished(Err(error)) if error.is_suspended() => {
            InvocationResponse::waiting()
        }
        HandlerOutcome::Finished(Err(error)) => {
            let error_object = ErrorObject::from(&error);
            match state.complete_execution_failure(error_object.clone()).await {
                Ok(()) => InvocationResponse::failed(error_object),
                Err(complete_error) if complete_error.is_suspended() => {
                    InvocationResponse::waiting()
                }
                Err(_) => InvocationResponse::failed(error_object),
            }
        }
        HandlerOutcome::Terminated => InvocationResponse::waiting(),
    };

    let invocation_error = response.error.clone();
    if let Err(error) = client
        .complete_invocation(&request.execution_id, &request.invocation_id, invocation_error)
        .await
    {
        warn!(
            execution_id = %request.execution_id,
            invocation_id = %request.invocation_id,
            %error,
            "failed to record invocation completion"
        );
    }
    tracker.complete(&request.invocation_id);

    debug!(
        execution_id = %request.execution_id,
        invocation_id = %request.invocation_id,
        status = ?response.status,
        "invocation finished"
    );
    response
}
