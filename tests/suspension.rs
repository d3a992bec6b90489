//! Suspension at the host boundary: blocked executions report WAITING,
//! release their invocation, and pick up exactly where they left off once
//! the blocking event arrives.

mod common;

use common::Driver;
use durafn::{
    CallbackConfig, CheckpointClient, Duration, ExecutionContext, InvocationStatus,
    OperationStatus,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_lone_wait_reports_waiting_then_completes() {
    let mut driver = Driver::start(None).await;

    let make = || {
        |ctx: ExecutionContext| async move {
            ctx.wait(Some("overnight"), Duration::from_hours(8)).await?;
            Ok("morning")
        }
    };

    let first = driver.run(make()).await;
    assert_eq!(first.status, InvocationStatus::Waiting);
    assert!(first.result.is_none());
    assert!(first.error.is_none());
    let op = driver.client.operation(&driver.execution_id, "1").await.unwrap();
    assert_eq!(op.status, OperationStatus::Started);

    driver.advance(8.0 * 3600.0 + 1.0).await;
    let second = driver.run(make()).await;
    assert_eq!(second.status, InvocationStatus::Succeeded);
    assert_eq!(second.result.as_deref(), Some("\"morning\""));
}

#[tokio::test]
async fn test_callback_completed_out_of_band() {
    let mut driver = Driver::start(None).await;
    let submitted = Arc::new(Mutex::new(None::<String>));
    let submissions = Arc::new(AtomicU32::new(0));

    let make = |submitted: Arc<Mutex<Option<String>>>, submissions: Arc<AtomicU32>| {
        move |ctx: ExecutionContext| async move {
            let approval: String = ctx
                .wait_for_callback(
                    Some("approval"),
                    CallbackConfig::new(),
                    move |callback_id| {
                        let submitted = Arc::clone(&submitted);
                        let submissions = Arc::clone(&submissions);
                        async move {
                            submissions.fetch_add(1, Ordering::SeqCst);
                            *submitted.lock().unwrap() = Some(callback_id);
                            Ok(())
                        }
                    },
                )
                .await?;
            Ok(approval)
        }
    };

    let first = driver
        .run(make(Arc::clone(&submitted), Arc::clone(&submissions)))
        .await;
    assert_eq!(first.status, InvocationStatus::Waiting);
    assert_eq!(submissions.load(Ordering::SeqCst), 1);

    let callback_id = submitted.lock().unwrap().clone().unwrap();
    driver
        .client
        .complete_callback(&callback_id, Some("\"approved\"".to_string()))
        .await
        .unwrap();

    let second = driver
        .run(make(Arc::clone(&submitted), Arc::clone(&submissions)))
        .await;
    assert_eq!(second.status, InvocationStatus::Succeeded);
    assert_eq!(second.result.as_deref(), Some("\"approved\""));
    // The submit step replayed; the external system was not re-notified.
    assert_eq!(submissions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callback_timeout_fails_the_execution() {
    let mut driver = Driver::start(None).await;

    let make = || {
        |ctx: ExecutionContext| async move {
            let value: String = ctx
                .wait_for_callback(
                    Some("approval"),
                    CallbackConfig::new().with_timeout(Duration::from_seconds(60)),
                    |_callback_id| async { Ok(()) },
                )
                .await?;
            Ok(value)
        }
    };

    let first = driver.run(make()).await;
    assert_eq!(first.status, InvocationStatus::Waiting);

    driver.advance(61.0).await;
    let second = driver.run(make()).await;
    assert_eq!(second.status, InvocationStatus::Failed);
    let op = driver.client.operation(&driver.execution_id, "1").await.unwrap();
    assert_eq!(op.status, OperationStatus::TimedOut);
}

#[tokio::test]
async fn test_heartbeat_keeps_callback_alive() {
    let mut driver = Driver::start(None).await;
    let captured = Arc::new(Mutex::new(None::<String>));

    let make = |captured: Arc<Mutex<Option<String>>>| {
        move |ctx: ExecutionContext| async move {
            let handle = ctx
                .create_callback::<String>(
                    Some("job"),
                    CallbackConfig::new().with_heartbeat_timeout(Duration::from_seconds(60)),
                )
                .await?;
            *captured.lock().unwrap() = Some(handle.callback_id().to_string());
            handle.result().await
        }
    };

    let first = driver.run(make(Arc::clone(&captured))).await;
    assert_eq!(first.status, InvocationStatus::Waiting);
    let callback_id = captured.lock().unwrap().clone().unwrap();

    // Past the original heartbeat deadline, but each heartbeat renews it.
    driver.advance(50.0).await;
    driver.client.heartbeat_callback(&callback_id).await.unwrap();
    driver.advance(50.0).await;
    driver
        .client
        .complete_callback(&callback_id, Some("\"done\"".to_string()))
        .await
        .unwrap();

    let second = driver.run(make(Arc::clone(&captured))).await;
    assert_eq!(second.status, InvocationStatus::Succeeded);
    assert_eq!(second.result.as_deref(), Some("\"done\""));
}

#[tokio::test]
async fn test_missed_heartbeat_times_out() {
    let mut driver = Driver::start(None).await;
    let captured = Arc::new(Mutex::new(None::<String>));

    let make = |captured: Arc<Mutex<Option<String>>>| {
        move |ctx: ExecutionContext| async move {
            let handle = ctx
                .create_callback::<String>(
                    Some("job"),
                    CallbackConfig::new().with_heartbeat_timeout(Duration::from_seconds(60)),
                )
                .await?;
            *captured.lock().unwrap() = Some(handle.callback_id().to_string());
            handle.result().await
        }
    };

    let first = driver.run(make(Arc::clone(&captured))).await;
    assert_eq!(first.status, InvocationStatus::Waiting);

    driver.advance(61.0).await;
    let second = driver.run(make(Arc::clone(&captured))).await;
    assert_eq!(second.status, InvocationStatus::Failed);
    let op = driver.client.operation(&driver.execution_id, "1").await.unwrap();
    assert_eq!(op.status, OperationStatus::TimedOut);
}

#[tokio::test]
async fn test_waiting_invocation_releases_tracker() {
    let mut driver = Driver::start(None).await;

    let response = driver
        .run(|ctx: ExecutionContext| async move {
            ctx.wait(None, Duration::from_hours(1)).await?;
            Ok(0)
        })
        .await;
    assert_eq!(response.status, InvocationStatus::Waiting);
    assert!(!driver.tracker.has_active_invocation());
}
