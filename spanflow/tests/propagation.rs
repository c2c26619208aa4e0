//! End-to-end propagation across executors, threads, and async tasks.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use spanflow::activation::Scheduler;
use spanflow::diagnostic::MappedDiagnosticContext;
use spanflow::span::Span;
use spanflow::task::TracedExecutor;
use spanflow::testing::{TestSpan, ThreadExecutor};
use spanflow::FutureSpanExt;

fn as_dyn(span: &Arc<TestSpan>) -> Arc<dyn Span> {
    span.clone()
}

/// The worker-pool scenario: a parent span fans out to workers that outlive
/// the parent's own activation, each worker forking again for a nested task.
#[test]
fn worker_pool_fan_out() {
    let scheduler = Scheduler::with_diagnostics(Arc::new(MappedDiagnosticContext::new()));
    let (finished_tx, finished_rx) = mpsc::channel();
    let parent = Arc::new(TestSpan::with_sink("parent", finished_tx));
    let pool = TracedExecutor::new(ThreadExecutor::new(), scheduler.clone());

    {
        let handle = scheduler.capture(Some(as_dyn(&parent))).activate();

        for worker in 0..8 {
            MappedDiagnosticContext::put("worker", worker.to_string());
            let scheduler = scheduler.clone();
            let parent = parent.clone();
            pool.execute(move || {
                let active = scheduler.active().expect("worker should see the parent span");
                assert!(Arc::ptr_eq(&active, &as_dyn(&parent)));
                assert_eq!(
                    MappedDiagnosticContext::get("worker").as_deref(),
                    Some(worker.to_string().as_str()),
                );
                parent.set_tag(format!("worker.{worker}"), "done");
            })
            .expect("pool accepts tasks");
        }

        // The parent's own activation ends while workers may still be
        // running; its span must stay open for them.
        handle.deactivate();
    }

    pool.inner().join();
    assert_eq!(
        finished_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "parent"
    );
    assert_eq!(parent.finish_calls(), 1);
    assert_eq!(parent.refs(), 0);
    for worker in 0..8 {
        assert_eq!(parent.tag(&format!("worker.{worker}")).as_deref(), Some("done"));
    }
}

/// A parent that finishes before its handed-off children deactivate must
/// never come back as the active span on the worker thread.
#[test]
fn early_finished_parent_stays_gone_on_workers() {
    let scheduler = Scheduler::new();
    let parent = Arc::new(TestSpan::new("parent"));
    let child = Arc::new(TestSpan::new("child"));

    let parent_handle = scheduler.capture(Some(as_dyn(&parent))).activate();
    let parent_continuation = parent_handle.fork();

    let scheduler_for_worker = scheduler.clone();
    let child_for_worker = child.clone();
    let parent_for_worker = parent.clone();
    let worker = std::thread::spawn(move || {
        let scheduler = scheduler_for_worker;
        let parent_handle = parent_continuation.activate();
        let child_handle = scheduler.capture(Some(as_dyn(&child_for_worker))).activate();

        // The parent span dies while the child is still active here.
        parent_for_worker.finish();

        child_handle.deactivate();
        assert!(
            scheduler.active().is_none(),
            "the finished parent frame must be skipped, not reinstated"
        );
        parent_handle.deactivate();
        assert!(scheduler.active().is_none());
    });
    worker.join().unwrap();

    parent_handle.deactivate();
    assert_eq!(parent.finish_calls(), 1);
    assert!(child.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn span_follows_future_across_await_points() {
    let scheduler = Scheduler::new();
    let span = Arc::new(TestSpan::new("async"));

    let handle = scheduler.capture(Some(as_dyn(&span))).activate();
    let fut = {
        let scheduler = scheduler.clone();
        let span = span.clone();
        async move {
            let before = scheduler.active().expect("active before await");
            assert!(Arc::ptr_eq(&before, &as_dyn(&span)));

            tokio::time::sleep(Duration::from_millis(10)).await;

            let after = scheduler.active().expect("active after await");
            assert!(Arc::ptr_eq(&after, &as_dyn(&span)));
        }
    }
    .with_active_span(&scheduler);
    handle.deactivate();
    assert!(!span.is_finished());

    tokio::spawn(fut).await.unwrap();
    assert!(span.is_finished());
    assert_eq!(span.finish_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diagnostics_follow_future_to_worker_threads() {
    let scheduler = Scheduler::with_diagnostics(Arc::new(MappedDiagnosticContext::new()));

    MappedDiagnosticContext::put("request", "r-42");
    let fut = async {
        assert_eq!(
            MappedDiagnosticContext::get("request").as_deref(),
            Some("r-42"),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            MappedDiagnosticContext::get("request").as_deref(),
            Some("r-42"),
        );
    }
    .with_active_span(&scheduler);
    MappedDiagnosticContext::remove("request");

    tokio::spawn(fut).await.unwrap();
}

/// Concurrent deactivation of many forks across a pool still finishes the
/// span exactly once, after the last release.
#[test]
fn stampede_finishes_exactly_once() {
    let scheduler = Scheduler::new();
    let span = Arc::new(TestSpan::new("stampede"));
    let pool = TracedExecutor::with_span(ThreadExecutor::new(), scheduler.clone(), Some(as_dyn(&span)));

    let gate = scheduler.capture(Some(as_dyn(&span)));
    for _ in 0..32 {
        pool.execute(|| {}).unwrap();
    }
    drop(gate);

    pool.inner().join();
    assert_eq!(span.refs(), 0);
    assert_eq!(span.finish_calls(), 1);
}
