//! Traced wrappers for tasks and task executors.
//!
//! These are the primary clients of the activation core: they capture a
//! [`Continuation`] in the submitting context and activate it around the
//! task body in whichever context eventually runs it. Deactivation rides on
//! the [`ActiveHandle`](crate::activation::ActiveHandle) drop guard, so it
//! happens on every exit path, including unwinding.

use std::sync::Arc;

use thiserror::Error;

use crate::activation::{Continuation, Scheduler};
use crate::span::Span;

/// A unit of work bound to a captured span.
///
/// The Rust equivalent of a traced `Runnable`/`Callable`: any `FnOnce`,
/// with or without a return value, wrapped together with a [`Continuation`]
/// captured in the submitting context.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use spanflow::activation::Scheduler;
/// use spanflow::span::{NoopSpan, Span};
/// use spanflow::task::TracedTask;
///
/// let scheduler = Scheduler::new();
/// let span: Arc<dyn Span> = Arc::new(NoopSpan::new());
///
/// let task = {
///     let scheduler = scheduler.clone();
///     let task_scheduler = scheduler.clone();
///     TracedTask::with_span(&scheduler, Some(span.clone()), move || {
///         task_scheduler.active().is_some()
///     })
/// };
///
/// let worker = std::thread::spawn(move || task.run());
/// assert!(worker.join().unwrap());
/// assert!(span.is_finished());
/// ```
#[derive(Debug)]
pub struct TracedTask<F> {
    inner: F,
    continuation: Continuation,
}

impl<F, R> TracedTask<F>
where
    F: FnOnce() -> R,
{
    /// Wraps `inner` under the global scheduler's currently active span.
    pub fn new(inner: F) -> Self {
        TracedTask::from_active(&crate::global::scheduler(), inner)
    }

    /// Wraps `inner` under whatever span is active for `scheduler` at wrap
    /// time.
    pub fn from_active(scheduler: &Scheduler, inner: F) -> Self {
        TracedTask {
            inner,
            continuation: scheduler.capture_active(),
        }
    }

    /// Wraps `inner` under `span`.
    pub fn with_span(scheduler: &Scheduler, span: Option<Arc<dyn Span>>, inner: F) -> Self {
        TracedTask {
            inner,
            continuation: scheduler.capture(span),
        }
    }

    /// Wraps `inner` under an already-captured continuation.
    pub fn from_continuation(continuation: Continuation, inner: F) -> Self {
        TracedTask {
            inner,
            continuation,
        }
    }

    /// Runs the task with its span active on the calling thread.
    ///
    /// The handle deactivates when it drops, so the span reference is
    /// released exactly once whether the task returns or unwinds.
    pub fn run(self) -> R {
        let _handle = self.continuation.activate();
        (self.inner)()
    }
}

/// Errors surfaced by task submission.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The executor is no longer accepting tasks.
    #[error("executor rejected the task: already shut down")]
    Shutdown,

    /// Submission failed for an executor-specific reason.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Minimal task-submission contract the traced wrapper builds on.
///
/// Scheduling mechanics (queues, worker threads, backpressure) belong to the
/// implementation; the wrapper only needs a way to hand over a boxed task.
pub trait Executor {
    /// Submits `task` for eventual execution.
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), ExecutorError>;
}

enum SpanBinding {
    /// Capture whatever is active for the scheduler at each submission.
    Ambient,
    /// Always capture this span.
    Pinned(Option<Arc<dyn Span>>),
}

/// An [`Executor`] wrapper that transplants the active span into each
/// submitted task.
///
/// Every submission captures its own [`Continuation`], and with it its own
/// reference on the span, so workers deactivate independently and the span
/// finishes only after the last of them is done.
pub struct TracedExecutor<E> {
    inner: E,
    scheduler: Scheduler,
    binding: SpanBinding,
}

impl<E: Executor> TracedExecutor<E> {
    /// Wraps `inner` over the global scheduler; each submission carries the
    /// span active at submit time.
    pub fn from_global(inner: E) -> Self {
        TracedExecutor::new(inner, crate::global::scheduler())
    }

    /// Wraps `inner` so each submission carries the span active for
    /// `scheduler` at submit time.
    pub fn new(inner: E, scheduler: Scheduler) -> Self {
        TracedExecutor {
            inner,
            scheduler,
            binding: SpanBinding::Ambient,
        }
    }

    /// Wraps `inner` so every submission carries `span`.
    pub fn with_span(inner: E, scheduler: Scheduler, span: Option<Arc<dyn Span>>) -> Self {
        TracedExecutor {
            inner,
            scheduler,
            binding: SpanBinding::Pinned(span),
        }
    }

    fn capture(&self) -> Continuation {
        match &self.binding {
            SpanBinding::Ambient => self.scheduler.capture_active(),
            SpanBinding::Pinned(span) => self.scheduler.capture(span.clone()),
        }
    }

    /// Submits `task` wrapped with a freshly captured continuation.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        let traced = TracedTask::from_continuation(self.capture(), task);
        self.inner.execute(Box::new(move || traced.run()))
    }

    /// Submits a batch, wrapping each task with its own continuation.
    ///
    /// Each worker ends up holding an independent reference to the span, so
    /// the tasks may run and deactivate in any order on any threads.
    /// Submission stops at the first executor rejection; tasks already
    /// submitted keep their references and release them normally when run.
    pub fn execute_all(
        &self,
        tasks: Vec<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<(), ExecutorError> {
        for task in tasks {
            let traced = TracedTask::from_continuation(self.capture(), task);
            self.inner.execute(Box::new(move || traced.run()))?;
        }
        Ok(())
    }

    /// Returns the wrapped executor.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Unwraps the executor.
    pub fn into_inner(self) -> E {
        self.inner
    }
}
