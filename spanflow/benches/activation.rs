use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use spanflow::activation::Scheduler;
use spanflow::span::{NoopSpan, Span};

// Run this benchmark with:
// cargo bench --bench activation

fn criterion_benchmark(c: &mut Criterion) {
    let scheduler = Scheduler::new();
    let cases: Vec<(&str, Option<Arc<dyn Span>>)> = vec![
        ("no_span", None),
        ("noop_span", Some(Arc::new(NoopSpan::new()))),
    ];

    for (name, span) in &cases {
        single_activation(c, &scheduler, name, span);
        nested_activation(c, &scheduler, name, span);
    }
    active_lookup(c, &scheduler);
    fork_handoff(c, &scheduler);
}

fn single_activation(
    c: &mut Criterion,
    scheduler: &Scheduler,
    case: &str,
    span: &Option<Arc<dyn Span>>,
) {
    c.bench_function(&format!("capture_activate_deactivate/{case}"), |b| {
        b.iter(|| {
            let handle = scheduler.capture(black_box(span.clone())).activate();
            handle.deactivate();
        });
    });
}

fn nested_activation(
    c: &mut Criterion,
    scheduler: &Scheduler,
    case: &str,
    span: &Option<Arc<dyn Span>>,
) {
    c.bench_function(&format!("nested_activation/{case}"), |b| {
        b.iter(|| {
            let outer = scheduler.capture(black_box(span.clone())).activate();
            let inner = scheduler.capture(black_box(span.clone())).activate();
            inner.deactivate();
            outer.deactivate();
        });
    });
}

fn active_lookup(c: &mut Criterion, scheduler: &Scheduler) {
    let span: Arc<dyn Span> = Arc::new(NoopSpan::new());
    let _handle = scheduler.capture(Some(span)).activate();
    c.bench_function("active_lookup", |b| {
        b.iter(|| {
            black_box(scheduler.active());
        });
    });
}

fn fork_handoff(c: &mut Criterion, scheduler: &Scheduler) {
    let span: Arc<dyn Span> = Arc::new(NoopSpan::new());
    let handle = scheduler.capture(Some(span)).activate();
    c.bench_function("fork_activate_deactivate", |b| {
        b.iter(|| {
            let continuation = handle.fork();
            continuation.activate().deactivate();
        });
    });
    handle.deactivate();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
