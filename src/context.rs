//! The author-facing execution context.
//!
//! A context owns a deterministic operation id counter: every primitive
//! derives its id synchronously at call time, in call order, before any
//! future is polled. That is what makes ids stable under combinators,
//! where futures are created in source order but polled in race order.
//!
//! Child contexts prefix their parent operation's id, so the nesting of
//! scopes is readable straight off the id ("2-1" is the first operation
//! inside the context recorded as "2").

use crate::config::{CallbackConfig, InvokeConfig, MapConfig, StepConfig};
use crate::duration::Duration;
use crate::error::EngineError;
use crate::handlers::callback::CallbackHandle;
use crate::handlers::combinators::SettledOutcome;
use crate::handlers::step::StepContext;
use crate::handlers::wait::WaitTarget;
use crate::handlers::{self, BoxError};
use crate::state::ExecutionState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A boxed durable operation future, as passed to combinators.
pub type BoxedOperation<T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'static>>;

/// A boxed branch body, as passed to `parallel`.
pub type BranchFn<T> = Box<dyn FnOnce(ExecutionContext) -> BoxedOperation<T> + Send + 'static>;

const CONTEXT_REENTRANCY: &str = "CONTEXT_REENTRANCY";

/// Identity assigned to an operation at call time.
#[derive(Debug, Clone)]
pub struct OperationIdentifier {
    pub operation_id: String,
    pub parent_id: Option<String>,
    pub name: Option<String>,
}

/// Per-context id counter. Strictly increasing, never reused.
struct OperationIdGenerator {
    prefix: Option<String>,
    next: AtomicU64,
    name_counts: Mutex<HashMap<String, u32>>,
}

impl OperationIdGenerator {
    fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(0),
            name_counts: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.prefix {
            Some(prefix) => format!("{prefix}-{n}"),
            None => n.to_string(),
        }
    }

    /// Duplicate names get a per-name suffix so lookups stay unambiguous.
    fn disambiguate(&self, name: &str) -> String {
        let mut counts = match self.name_counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            name.to_string()
        } else {
            format!("{name}-{count}")
        }
    }
}

/// Tracks which context scopes currently have a body running, so using a
/// context inside an operation it itself opened is caught at runtime.
pub(crate) struct ReentrancyGuard {
    active: Mutex<HashMap<u64, usize>>,
}

impl ReentrancyGuard {
    fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    fn enter(self: &Arc<Self>, token: u64) -> ActiveScope {
        {
            let mut active = match self.active.lock() {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
            *active.entry(token).or_insert(0) += 1;
        }
        ActiveScope {
            guard: Arc::clone(self),
            token,
        }
    }

    fn is_active(&self, token: u64) -> bool {
        match self.active.lock() {
            Ok(active) => active.get(&token).copied().unwrap_or(0) > 0,
            Err(poisoned) => poisoned.into_inner().get(&token).copied().unwrap_or(0) > 0,
        }
    }
}

/// RAII marker for a scope whose body is executing.
pub(crate) struct ActiveScope {
    guard: Arc<ReentrancyGuard>,
    token: u64,
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        let mut active = match self.guard.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = active.get_mut(&self.token) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.token);
            }
        }
    }
}

/// Handle durable function code uses to record operations.
#[derive(Clone)]
pub struct ExecutionContext {
    state: Arc<ExecutionState>,
    ids: Arc<OperationIdGenerator>,
    guard: Arc<ReentrancyGuard>,
    parent_id: Option<String>,
    scope_token: u64,
}

impl ExecutionContext {
    pub(crate) fn root(state: Arc<ExecutionState>) -> Self {
        let scope_token = state.allocate_context_token();
        Self {
            state,
            ids: Arc::new(OperationIdGenerator::new(None)),
            guard: Arc::new(ReentrancyGuard::new()),
            parent_id: None,
            scope_token,
        }
    }

    pub(crate) fn child(&self, context_operation_id: &str) -> Self {
        Self {
            state: Arc::clone(&self.state),
            ids: Arc::new(OperationIdGenerator::new(Some(
                context_operation_id.to_string(),
            ))),
            guard: Arc::clone(&self.guard),
            parent_id: Some(context_operation_id.to_string()),
            scope_token: self.state.allocate_context_token(),
        }
    }

    pub(crate) fn state(&self) -> Arc<ExecutionState> {
        Arc::clone(&self.state)
    }

    pub(crate) fn enter_scope(&self) -> ActiveScope {
        self.guard.enter(self.scope_token)
    }

    /// The execution this context belongs to.
    pub fn execution_id(&self) -> &str {
        &self.state.execution_id
    }

    /// Deserializes the execution's original input.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        handlers::deserialize_result(self.state.input())
    }

    fn ensure_usable(&self) -> Result<(), EngineError> {
        if self.guard.is_active(self.scope_token) {
            return Err(EngineError::validation(
                CONTEXT_REENTRANCY,
                "a context cannot be used inside an operation it opened; \
                 use the context passed to the operation body",
            ));
        }
        Ok(())
    }

    pub(crate) fn identifier(&self, name: Option<&str>) -> OperationIdentifier {
        OperationIdentifier {
            operation_id: self.ids.next_id(),
            parent_id: self.parent_id.clone(),
            name: name.map(|n| self.ids.disambiguate(n)),
        }
    }

    /// Runs a checkpointed unit of work with the default retry policy.
    ///
    /// The closure may run more than once: on retry, and again on a later
    /// invocation if the host dies between running it and checkpointing.
    pub fn step<T, F, Fut>(
        &self,
        name: Option<&str>,
        func: F,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.step_with_config(name, StepConfig::new(), func)
    }

    /// Runs a checkpointed unit of work with an explicit configuration.
    pub fn step_with_config<T, F, Fut>(
        &self,
        name: Option<&str>,
        config: StepConfig,
        func: F,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::step::execute(state, ident, config, func).await
        }
    }

    /// Waits durably for the given duration.
    pub fn wait(
        &self,
        name: Option<&str>,
        duration: Duration,
    ) -> impl Future<Output = Result<(), EngineError>> + Send + 'static {
        self.wait_target(name, WaitTarget::Seconds(duration.to_seconds()))
    }

    /// Waits durably until an absolute time (epoch seconds).
    pub fn wait_until(
        &self,
        name: Option<&str>,
        timestamp: f64,
    ) -> impl Future<Output = Result<(), EngineError>> + Send + 'static {
        self.wait_target(name, WaitTarget::Until(timestamp))
    }

    fn wait_target(
        &self,
        name: Option<&str>,
        target: WaitTarget,
    ) -> impl Future<Output = Result<(), EngineError>> + Send + 'static {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::wait::execute(state, ident, target).await
        }
    }

    /// Creates a callback an external system completes out of band.
    pub fn create_callback<T>(
        &self,
        name: Option<&str>,
        config: CallbackConfig,
    ) -> impl Future<Output = Result<CallbackHandle<T>, EngineError>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::callback::create(state, ident, config).await
        }
    }

    /// Creates a callback, runs `submitter` as a step to hand its id to an
    /// external system, and resolves with the callback's eventual payload.
    pub fn wait_for_callback<T, F, Fut>(
        &self,
        name: Option<&str>,
        config: CallbackConfig,
        submitter: F,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let usable = self.ensure_usable();
        let callback_ident = self.identifier(name);
        let submit_ident = self.identifier(name.map(|n| format!("{n}-submit")).as_deref());
        let state = self.state();
        async move {
            usable?;
            let handle: CallbackHandle<T> =
                handlers::callback::create(Arc::clone(&state), callback_ident, config).await?;
            let callback_id = handle.callback_id().to_string();
            let submit_config = StepConfig::new().with_sub_type("callback-submitter");
            handlers::step::execute(
                Arc::clone(&state),
                submit_ident,
                submit_config,
                move |_ctx| submitter(callback_id.clone()),
            )
            .await?;
            handle.result().await
        }
    }

    /// Invokes another durable function and resolves with its result.
    pub fn invoke<P, T>(
        &self,
        name: Option<&str>,
        function_name: impl Into<String>,
        payload: P,
        config: InvokeConfig,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        P: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        let function_name = function_name.into();
        async move {
            usable?;
            handlers::invoke::execute(state, ident, function_name, &payload, config).await
        }
    }

    /// Runs a body inside a nested context with its own id namespace.
    pub fn run_in_child_context<T, F, Fut>(
        &self,
        name: Option<&str>,
        body: F,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let parent = self.clone();
        async move {
            usable?;
            handlers::child::execute(parent, ident, body).await
        }
    }

    /// Runs every branch concurrently, each in its own child context, and
    /// resolves with the results in branch order.
    pub fn parallel<T>(
        &self,
        name: Option<&str>,
        branches: Vec<BranchFn<T>>,
    ) -> impl Future<Output = Result<Vec<T>, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let parent = self.clone();
        async move {
            usable?;
            handlers::parallel::execute(parent, ident, branches).await
        }
    }

    /// Applies `func` to every item with bounded concurrency, resolving
    /// with results in input order.
    pub fn map<I, T, F, Fut>(
        &self,
        name: Option<&str>,
        items: Vec<I>,
        config: MapConfig,
        func: F,
    ) -> impl Future<Output = Result<Vec<T>, EngineError>> + Send + 'static
    where
        I: Clone + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(ExecutionContext, I, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let parent = self.clone();
        async move {
            usable?;
            handlers::map::execute(parent, ident, items, config, func).await
        }
    }

    /// Resolves with every result, or the temporally first failure.
    pub fn all<T>(
        &self,
        name: Option<&str>,
        operations: Vec<BoxedOperation<T>>,
    ) -> impl Future<Output = Result<Vec<T>, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::combinators::all(state, ident, operations).await
        }
    }

    /// Resolves with the first operation to settle, success or failure.
    pub fn race<T>(
        &self,
        name: Option<&str>,
        operations: Vec<BoxedOperation<T>>,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::combinators::race(state, ident, operations).await
        }
    }

    /// Resolves with the first success; fails only when every operation
    /// fails.
    pub fn any<T>(
        &self,
        name: Option<&str>,
        operations: Vec<BoxedOperation<T>>,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::combinators::any(state, ident, operations).await
        }
    }

    /// Resolves once every operation settles, with per-operation outcomes.
    pub fn all_settled<T>(
        &self,
        name: Option<&str>,
        operations: Vec<BoxedOperation<T>>,
    ) -> impl Future<Output = Result<Vec<SettledOutcome<T>>, EngineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let usable = self.ensure_usable();
        let ident = self.identifier(name);
        let state = self.state();
        async move {
            usable?;
            handlers::combinators::all_settled(state, ident, operations).await
        }
    }
}
