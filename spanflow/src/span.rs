//! The span lifecycle interface consumed by the activation machinery.
//!
//! Span *data* (operation names, tags, logs, identifiers) lives in whatever
//! tracing implementation this crate is paired with. The activation core
//! only needs the lifecycle surface defined here: finishing exactly once,
//! reporting finished state, and reference accounting for outstanding
//! activations.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lifecycle interface a span implementation exposes to the scheduler.
///
/// Spans are shared as `Arc<dyn Span>`; "no span" is represented as `None`
/// and is a valid value everywhere, never an error.
///
/// # Implementing
///
/// Implementations typically embed a [`SpanState`] for the reference count
/// and the finish-once flag:
///
/// ```
/// use spanflow::span::{Span, SpanState};
///
/// #[derive(Debug, Default)]
/// struct MySpan {
///     state: SpanState,
/// }
///
/// impl Span for MySpan {
///     fn finish(&self) {
///         if self.state.try_finish() {
///             // report the span to a sink, record the end timestamp, ...
///         }
///     }
///
///     fn is_finished(&self) -> bool {
///         self.state.is_finished()
///     }
///
///     fn inc_ref(&self) {
///         self.state.inc();
///     }
///
///     fn dec_ref(&self) -> usize {
///         self.state.dec()
///     }
/// }
/// ```
pub trait Span: fmt::Debug + Send + Sync {
    /// Marks the span finished.
    ///
    /// The side effects of finishing (recording the end timestamp, emitting
    /// the span to a sink) must run at most once, even when concurrent
    /// deactivations race to be the one that drops the last reference.
    fn finish(&self);

    /// Returns `true` once [`finish`](Span::finish) has run.
    ///
    /// The deactivation restore walk uses this to skip over frames whose
    /// span is already dead.
    fn is_finished(&self) -> bool;

    /// Increments the count of activation references pinning this span.
    fn inc_ref(&self);

    /// Decrements the reference count, returning the new count.
    fn dec_ref(&self) -> usize;
}

/// Reference count and finish-once flag for [`Span`] implementations.
///
/// The count starts at zero; the first capture brings it to one. The
/// finished flag is a compare-and-set so the finish side effects run at
/// most once regardless of which thread's decrement reaches zero first.
#[derive(Debug, Default)]
pub struct SpanState {
    refs: AtomicUsize,
    finished: AtomicBool,
}

impl SpanState {
    /// Creates a state with zero references, not finished.
    pub fn new() -> Self {
        SpanState::default()
    }

    /// Increments the reference count.
    pub fn inc(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count, returning the new count.
    pub fn dec(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "span reference count underflow");
        prev.saturating_sub(1)
    }

    /// Returns the current reference count.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Transitions to finished, returning `true` for exactly one caller.
    pub fn try_finish(&self) -> bool {
        self.finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns `true` once the state has transitioned to finished.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// A span that records nothing but keeps correct lifecycle accounting.
///
/// Useful as a stand-in where callers require a span but no tracing
/// implementation is configured.
#[derive(Debug, Default)]
pub struct NoopSpan {
    state: SpanState,
}

impl NoopSpan {
    /// Creates an unfinished no-op span with zero references.
    pub fn new() -> Self {
        NoopSpan::default()
    }
}

impl Span for NoopSpan {
    fn finish(&self) {
        self.state.try_finish();
    }

    fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    fn inc_ref(&self) {
        self.state.inc();
    }

    fn dec_ref(&self) -> usize {
        self.state.dec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn finish_transitions_once() {
        let state = SpanState::new();
        assert!(!state.is_finished());
        assert!(state.try_finish());
        assert!(!state.try_finish());
        assert!(state.is_finished());
    }

    #[test]
    fn ref_counting_round_trip() {
        let state = SpanState::new();
        state.inc();
        state.inc();
        assert_eq!(state.refs(), 2);
        assert_eq!(state.dec(), 1);
        assert_eq!(state.dec(), 0);
    }

    #[test]
    fn concurrent_decrement_finishes_once() {
        let span = Arc::new(NoopSpan::new());
        let winners = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            span.inc_ref();
        }

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let span = span.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if span.dec_ref() == 0 && span.state.try_finish() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(span.state.refs(), 0);
    }
}
