//! In-process active-span scheduling and propagation.
//!
//! In any execution context there is at most one span primarily responsible
//! for the work the surrounding code is doing. `spanflow` keeps track of
//! that span per thread and moves it across asynchronous boundaries (worker
//! pools, callbacks, futures) without losing it or finishing it twice.
//!
//! The crate does not define span *data*: operation names, tags, logs, and
//! identifiers belong to whatever tracing implementation sits behind the
//! [`Span`] trait. What lives here is the activation machinery:
//!
//! - **[`activation`]**: the [`Scheduler`] with its per-thread
//!   current-frame slot, one-shot [`Continuation`] tokens for shipping an
//!   in-flight span to another thread of control, and [`ActiveHandle`]
//!   guards whose deactivation restores the prior state, skipping over
//!   frames whose span has already finished, since fan-out means parents
//!   can die before their handed-off children.
//! - **[`task`]**: traced closure and executor wrappers, the primary
//!   clients of the core. Each submission captures its own reference to the
//!   span; the span auto-finishes when the last reference is released.
//! - **[`diagnostic`]**: pluggable ambient key/value logging state
//!   ("mapped diagnostic context") captured and restored alongside span
//!   activation.
//! - **[`global`]**: the process-default scheduler the wrappers fall back
//!   to.
//!
//! # Getting Started
//!
//! ```
//! use std::sync::Arc;
//! use spanflow::{NoopSpan, Scheduler, Span};
//!
//! let scheduler = Scheduler::new();
//! let span: Arc<dyn Span> = Arc::new(NoopSpan::new());
//!
//! // Make the span current for this thread.
//! let handle = scheduler.capture(Some(span.clone())).activate();
//! assert!(scheduler.active().is_some());
//!
//! // Hand the span to another thread; the fork holds its own reference,
//! // so the span finishes only after both sides deactivate.
//! let continuation = handle.fork();
//! let worker = {
//!     let scheduler = scheduler.clone();
//!     std::thread::spawn(move || {
//!         let handle = continuation.activate();
//!         assert!(scheduler.active().is_some());
//!         handle.deactivate();
//!     })
//! };
//! worker.join().unwrap();
//!
//! handle.deactivate();
//! assert!(scheduler.active().is_none());
//! assert!(span.is_finished());
//! ```
//!
//! # Feature Flags
//!
//! - `futures` (default): [`WithSpan`] and the `with_active_span`
//!   combinators for futures, streams, and sinks.
//! - `internal-logs`: routes this crate's internal diagnostics through
//!   [`tracing`](https://crates.io/crates/tracing).
//! - `testing`: in-memory spans and a thread-per-task executor for tests.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod activation;
pub mod diagnostic;
pub mod global;
mod internal_logging;
pub mod span;
pub mod task;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

pub use activation::{ActiveHandle, Continuation, Scheduler};
#[cfg(feature = "futures")]
#[cfg_attr(docsrs, doc(cfg(feature = "futures")))]
pub use activation::{FutureSpanExt, SinkSpanExt, StreamSpanExt, WithSpan};
pub use diagnostic::{
    DiagnosticContext, DiagnosticSnapshot, MappedDiagnosticContext, NoopDiagnosticContext,
};
pub use span::{NoopSpan, Span, SpanState};
pub use task::{Executor, ExecutorError, TracedExecutor, TracedTask};

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
