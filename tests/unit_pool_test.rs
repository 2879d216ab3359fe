use parlor::RelayError;
use parlor::core::pool::WorkerPool;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_posted_job_runs() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(2, &shutdown_tx);
    let handle = pool.handle();

    let (done_tx, done_rx) = oneshot::channel();
    handle.post(async move {
        let _ = done_tx.send(42u32);
        Ok(())
    });

    let value = timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("job never ran")
        .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn test_panicking_job_does_not_kill_worker() {
    let (shutdown_tx, _) = broadcast::channel(1);
    // A single worker: if the panic killed it, the follow-up job would hang.
    let pool = WorkerPool::spawn(1, &shutdown_tx);
    let handle = pool.handle();

    handle.post(async move { panic!("job blew up") });

    let (done_tx, done_rx) = oneshot::channel();
    handle.post(async move {
        let _ = done_tx.send(());
        Ok(())
    });

    assert_ok!(timeout(Duration::from_secs(5), done_rx).await.expect("worker died"));
}

#[tokio::test]
async fn test_failed_job_reaches_unhandled_handler() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(2, &shutdown_tx);
    let handle = pool.handle();

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    handle.set_unhandled_error_handler(move |e| {
        let _ = err_tx.send(e);
    });

    handle.post(async move { Err(RelayError::Internal("boom".into())) });

    let reported = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("error was never reported")
        .unwrap();
    assert!(matches!(reported, RelayError::Internal(msg) if msg == "boom"));
}

#[tokio::test]
async fn test_panic_is_reported_with_payload() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(1, &shutdown_tx);
    let handle = pool.handle();

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    handle.set_unhandled_error_handler(move |e| {
        let _ = err_tx.send(e);
    });

    handle.post(async move { panic!("kaboom") });

    let reported = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("panic was never reported")
        .unwrap();
    assert!(
        matches!(&reported, RelayError::Internal(msg) if msg.contains("kaboom")),
        "got {reported:?}"
    );
}

#[tokio::test]
async fn test_queue_len_tracks_backlog() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(1, &shutdown_tx);
    let handle = pool.handle();

    // Park the only worker on a job that waits for permission to finish.
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    handle.post(async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok(())
    });
    started_rx.await.unwrap();

    handle.post(async { Ok(()) });
    handle.post(async { Ok(()) });
    assert_eq!(handle.queue_len(), 2);

    let _ = release_tx.send(());
}

#[tokio::test]
async fn test_in_flight_job_finishes_before_shutdown() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(1, &shutdown_tx);
    let handle = pool.handle();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    handle.post(async move {
        let _ = started_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = done_tx.send(());
        Ok(())
    });
    started_rx.await.unwrap();

    // Shutdown while the job is mid-flight: it still runs to completion.
    let _ = shutdown_tx.send(());
    timeout(Duration::from_secs(5), pool.shutdown()).await.unwrap();
    assert_ok!(done_rx.await);
}

#[tokio::test]
async fn test_post_after_shutdown_is_quietly_dropped() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(2, &shutdown_tx);
    let handle = pool.handle();

    let _ = shutdown_tx.send(());
    timeout(Duration::from_secs(5), pool.shutdown()).await.unwrap();

    // The pool does not refuse posts at shutdown; the job just never runs.
    handle.post(async { Ok(()) });
}
