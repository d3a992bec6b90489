#![allow(dead_code)]

//! Drives executions against the in-memory backend the way a real host
//! would: one invocation at a time, each starting from a freshly polled
//! history page, with the simulated clock advanced in between.

use durafn::{
    run_invocation, CheckpointClient, EngineError, ExecutionContext, InMemoryCheckpointClient,
    InvocationRequest, InvocationResponse, InvocationTracker,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

pub struct Driver {
    pub client: Arc<InMemoryCheckpointClient>,
    pub tracker: Arc<InvocationTracker>,
    pub execution_id: String,
    input: Option<String>,
    first: Option<InvocationRequest>,
}

/// Captures engine tracing in test output; repeat calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

impl Driver {
    /// Starts a new execution and holds its first invocation request.
    pub async fn start(input: Option<&str>) -> Self {
        init_tracing();
        let client = Arc::new(InMemoryCheckpointClient::new());
        let input = input.map(|s| s.to_string());
        let resp = client.start_execution(input.clone()).await.unwrap();
        let first = InvocationRequest {
            execution_id: resp.execution_id.clone(),
            invocation_id: resp.invocation_id,
            checkpoint_token: resp.checkpoint_token,
            initial_operations: resp.operations,
            input: input.clone(),
        };
        Self {
            client,
            tracker: Arc::new(InvocationTracker::new()),
            execution_id: first.execution_id.clone(),
            input,
            first: Some(first),
        }
    }

    /// Runs one invocation of the handler. The first call uses the request
    /// from `start_execution`; later calls start a fresh invocation and
    /// re-poll the recorded history, exactly like a re-invoked host.
    pub async fn run<F, Fut, T>(&mut self, handler: F) -> InvocationResponse
    where
        F: FnOnce(ExecutionContext) -> Fut + Send,
        Fut: Future<Output = Result<T, EngineError>> + Send,
        T: Serialize,
    {
        let request = match self.first.take() {
            Some(request) => request,
            None => {
                let invocation = self
                    .client
                    .start_invocation(&self.execution_id)
                    .await
                    .unwrap();
                let page = self.client.poll_state(&self.execution_id, None).await.unwrap();
                InvocationRequest {
                    execution_id: self.execution_id.clone(),
                    invocation_id: invocation.invocation_id,
                    checkpoint_token: invocation.checkpoint_token,
                    initial_operations: page.operations,
                    input: self.input.clone(),
                }
            }
        };
        run_invocation(
            Arc::clone(&self.client) as Arc<dyn CheckpointClient>,
            Arc::clone(&self.tracker),
            request,
            handler,
        )
        .await
    }

    /// Moves the backend's simulated clock forward.
    pub async fn advance(&self, seconds: f64) {
        self.client.advance_clock(seconds).await;
    }
}
