//! Concurrency bound and failure handling of the bounded parallel runner.

use exporter_core::orchestration::{BoundedParallelRunner, TaskMetrics};
use exporter_core::ExporterError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_limit_bounds_tasks_in_flight() {
    let runner = BoundedParallelRunner::new("export", 2);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let start = tokio::time::Instant::now();
    let report = runner
        .run((0..5u64).collect(), |i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskMetrics::new(i, 10, 1000))
            }
        })
        .await
        .unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(report.peak_in_flight, 2);
    assert_eq!(report.completed, 5);
    // three batches of one second each
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(report.metrics, TaskMetrics::new(10, 50, 5000));
}

#[tokio::test(start_paused = true)]
async fn test_serial_runner_keeps_submission_order() {
    let runner = BoundedParallelRunner::serial("preprocess");
    let order = Arc::new(Mutex::new(Vec::new()));

    runner
        .run(vec!["first", "second", "third"], |statement| {
            let order = order.clone();
            async move {
                // later items finish faster, order still holds
                let delay = match statement {
                    "first" => 30,
                    "second" => 20,
                    _ => 10,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().push(statement);
                Ok(TaskMetrics::default())
            }
        })
        .await
        .unwrap();

    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn test_failure_stops_new_tasks_and_drains_running_ones() {
    let runner = BoundedParallelRunner::new("export", 2);
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let err = runner
        .run((0..6usize).collect(), |i| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    return Err(ExporterError::Query("boom".into()));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(TaskMetrics::default())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExporterError::Query(_)));
    // item 1 was already running next to the failing item and ran to completion
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_task_is_reported() {
    let runner = BoundedParallelRunner::new("export", 3);
    let err = runner
        .run(vec![1u8, 2, 3], |i| async move {
            if i == 2 {
                panic!("task {i} exploded");
            }
            Ok(TaskMetrics::default())
        })
        .await
        .unwrap_err();

    match err {
        ExporterError::TaskPanicked(message) => assert!(message.contains("exploded")),
        other => panic!("expected TaskPanicked, got {other:?}"),
    }
}

#[tokio::test]
async fn test_no_items_is_an_empty_success() {
    let report = BoundedParallelRunner::new("export", 4)
        .run(Vec::<u8>::new(), |_| async { Ok(TaskMetrics::default()) })
        .await
        .unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.metrics, TaskMetrics::default());
}

#[test]
fn test_zero_limit_is_raised_to_one() {
    assert_eq!(BoundedParallelRunner::new("export", 0).limit(), 1);
}
