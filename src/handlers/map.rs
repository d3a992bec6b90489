//! Bounded-concurrency map over a collection.
//!
//! Like `parallel`, the map is a CONTEXT operation with one child context
//! per item. Item operation ids are derived up front in input order; a
//! small worker pool pulls the next input index from a shared counter, so
//! freeing a slot always admits the earliest unprocessed item. Results are
//! returned in input order regardless of completion order.

use crate::config::MapConfig;
use crate::context::{ExecutionContext, OperationIdentifier};
use crate::error::{EngineError, ErrorObject};
use crate::handlers::{deserialize_result, expect_type, recorded_failure, serialize_payload};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) async fn execute<I, T, F, Fut>(
    parent: ExecutionContext,
    ident: OperationIdentifier,
    items: Vec<I>,
    config: MapConfig,
    func: F,
) -> Result<Vec<T>, EngineError>
where
    I: Clone + Send + Sync + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(ExecutionContext, I, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    let state = parent.state();
    let operation_id = ident.operation_id.clone();

    match state.operation(&operation_id).await {
        Some(op) => {
            expect_type(&op, OperationType::Context)?;
            match op.status {
                OperationStatus::Succeeded => {
                    debug!(
                        execution_id = %state.execution_id,
                        operation_id = %operation_id,
                        replayed = true,
                        "map replayed from history"
                    );
                    return deserialize_result(op.result.as_deref());
                }
                OperationStatus::Failed => return Err(recorded_failure(&op)),
                OperationStatus::Cancelled
                | OperationStatus::Stopped
                | OperationStatus::TimedOut => {
                    return Err(EngineError::execution(format!(
                        "map {operation_id} ended as {:?}",
                        op.status
                    )));
                }
                OperationStatus::Started | OperationStatus::Ready => {}
            }
        }
        None => {
            let mut update = OperationUpdate::start(&operation_id, OperationType::Context);
            update.parent_id = ident.parent_id.clone();
            update.name = ident.name.clone();
            update.sub_type = Some("map".to_string());
            state.checkpoint(update).await?;
        }
    }

    // The parent context is off limits inside item bodies, same as in a
    // plain child context.
    let _scope = parent.enter_scope();
    let aggregate = parent.child(&operation_id);
    let item_count = items.len();
    // Item ids assigned in input order, before any worker starts.
    let idents: Vec<OperationIdentifier> =
        (0..item_count).map(|_| aggregate.identifier(None)).collect();
    let idents = Arc::new(idents);
    let items = Arc::new(items);
    let func = Arc::new(func);

    let workers = config
        .max_concurrency
        .unwrap_or(item_count)
        .clamp(1, item_count.max(1));
    let next_index = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let tx = tx.clone();
        let ctx = aggregate.clone();
        let idents = Arc::clone(&idents);
        let items = Arc::clone(&items);
        let func = Arc::clone(&func);
        let next_index = Arc::clone(&next_index);
        handles.push(tokio::spawn(async move {
            loop {
                let index = next_index.fetch_add(1, Ordering::SeqCst);
                if index >= items.len() {
                    break;
                }
                let item = items[index].clone();
                let item_ident = idents[index].clone();
                let func = Arc::clone(&func);
                let result = crate::handlers::child::execute(
                    ctx.clone(),
                    item_ident,
                    move |child| func(child, item, index),
                )
                .await;
                let stop = result.is_err();
                if tx.send((index, result)).is_err() || stop {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut results: Vec<Option<T>> = (0..item_count).map(|_| None).collect();
    let mut first_error: Option<EngineError> = None;
    let mut suspended: Option<EngineError> = None;
    while let Some((index, result)) = rx.recv().await {
        match result {
            Ok(value) => results[index] = Some(value),
            Err(error) if error.is_suspended() => {
                if suspended.is_none() {
                    suspended = Some(error);
                }
            }
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }
    for handle in handles {
        let _ = handle.await;
    }

    if let Some(error) = suspended {
        return Err(error);
    }
    if let Some(error) = first_error {
        let update = OperationUpdate::fail(
            &operation_id,
            OperationType::Context,
            ErrorObject::from(&error),
        );
        state.checkpoint(update).await?;
        return Err(error);
    }

    let values: Vec<T> = results.into_iter().flatten().collect();
    let payload = serialize_payload(&values)?;
    let update = OperationUpdate::succeed(&operation_id, OperationType::Context, Some(payload));
    state.checkpoint(update).await?;
    Ok(values)
}
