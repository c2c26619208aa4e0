//! A parent span fanned out to a worker pool, with diagnostic context
//! travelling along. Run with:
//!
//!     cargo run --example worker_pool --features testing

use std::sync::mpsc;
use std::sync::Arc;

use spanflow::activation::Scheduler;
use spanflow::diagnostic::MappedDiagnosticContext;
use spanflow::span::Span;
use spanflow::task::{TracedExecutor, TracedTask};
use spanflow::testing::{TestSpan, ThreadExecutor};

fn main() {
    let scheduler = Scheduler::with_diagnostics(Arc::new(MappedDiagnosticContext::new()));
    let pool = TracedExecutor::new(ThreadExecutor::new(), scheduler.clone());

    let (finished_tx, finished_rx) = mpsc::channel();
    let parent = Arc::new(TestSpan::with_sink("parent", finished_tx));

    MappedDiagnosticContext::put("request_id", "r-1001");
    {
        let handle = scheduler
            .capture(Some(parent.clone() as Arc<dyn Span>))
            .activate();

        for child in 0..4 {
            MappedDiagnosticContext::put("child", child.to_string());
            let scheduler = scheduler.clone();
            pool.execute(move || {
                let active = scheduler.active().expect("parent span is active here");
                println!(
                    "child {} running under an active span (request_id={:?})",
                    child,
                    MappedDiagnosticContext::get("request_id"),
                );

                // Each child can fan out again; the grandchild task holds its
                // own reference to the same span.
                let grandchild = TracedTask::with_span(&scheduler, Some(active), move || {
                    println!(
                        "grandchild of child {} sees child={:?}",
                        child,
                        MappedDiagnosticContext::get("child"),
                    );
                });
                grandchild.run();
            })
            .expect("pool accepts tasks");
        }

        // The parent scope ends here; the span stays open until the last
        // worker releases its reference.
        handle.deactivate();
        println!("parent scope deactivated, workers may still be running");
    }

    pool.inner().join();
    while let Ok(name) = finished_rx.try_recv() {
        println!("finished span: {name}");
    }
    println!(
        "parent finished exactly once: {}",
        parent.finish_calls() == 1
    );
}
