//! Execution-scoped span activation.
//!
//! The `activation` module decides which span is "current" for each thread
//! and hands that state across asynchronous boundaries without losing or
//! double-finishing the span.
//!
//! # Main Types
//!
//! - [`Scheduler`]: owns the per-thread current-frame slot; `active()` and
//!   `capture()` live here.
//! - [`Continuation`]: a one-shot token that makes a captured span current
//!   in whichever execution context later activates it.
//! - [`ActiveHandle`]: the installed, live frame; deactivating it restores
//!   the prior state and releases the span reference it pins.
//!
//! # Propagation model
//!
//! Every capture and fork takes one reference on the span; every
//! deactivation (or drop of an unactivated [`Continuation`]) releases one.
//! When the last reference is released the span is finished automatically,
//! unless the capture opted out via [`Continuation::manual_finish`]. This is
//! what makes fan-out safe: a parent may deactivate, or even finish, before
//! workers holding forked continuations are done, and each worker still
//! observes a live reference until its own deactivation.
//!
//! Frames within one thread form a chain, and deactivation restores the
//! nearest predecessor whose span is still unfinished. Restoring a dead
//! frame is never correct: the span it pinned has already been reported.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::diagnostic::{DiagnosticContext, DiagnosticSnapshot, NoopDiagnosticContext};
use crate::span::Span;
use crate::spanflow_debug;


#[cfg(feature = "futures")]
mod future_ext;

#[cfg(feature = "futures")]
pub use future_ext::{FutureSpanExt, SinkSpanExt, StreamSpanExt, WithSpan};

thread_local! {
    static ACTIVE_FRAMES: RefCell<FrameSlots> = RefCell::new(FrameSlots::default());
}

type FrameSlots = HashMap<u64, Rc<ActivationFrame>, BuildHasherDefault<IdHasher>>;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(0);

/// Manages the active span for each thread that touches it.
///
/// A `Scheduler` is cheap to clone; clones share the same identity and see
/// the same active spans. Distinct `Scheduler` instances are fully
/// independent, each with its own current-frame slot on every thread, so
/// tests can run side by side without sharing state.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use spanflow::activation::Scheduler;
/// use spanflow::span::{NoopSpan, Span};
///
/// let scheduler = Scheduler::new();
/// assert!(scheduler.active().is_none());
///
/// let span: Arc<dyn Span> = Arc::new(NoopSpan::new());
/// let handle = scheduler.capture(Some(span.clone())).activate();
/// assert!(scheduler.active().is_some());
///
/// handle.deactivate();
/// assert!(scheduler.active().is_none());
/// assert!(span.is_finished());
/// ```
#[derive(Clone, Debug)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    id: u64,
    diagnostics: Arc<dyn DiagnosticContext>,
}

impl Scheduler {
    /// Creates a scheduler with no diagnostic context.
    pub fn new() -> Self {
        Scheduler::with_diagnostics(Arc::new(NoopDiagnosticContext))
    }

    /// Creates a scheduler that snapshots and restores `diagnostics`
    /// alongside span activation.
    pub fn with_diagnostics(diagnostics: Arc<dyn DiagnosticContext>) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
                diagnostics,
            }),
        }
    }

    /// Returns the span of the calling thread's current frame, if any.
    pub fn active(&self) -> Option<Arc<dyn Span>> {
        ACTIVE_FRAMES.with(|slots| {
            slots
                .borrow()
                .get(&self.inner.id)
                .and_then(|frame| frame.span.clone())
        })
    }

    /// Captures `span` along with the calling thread's diagnostic state,
    /// returning a one-shot [`Continuation`].
    ///
    /// Takes one reference on the span. `None` is a valid input: activating
    /// the resulting continuation makes "no span" current, which is how a
    /// task scheduled from an untraced context suppresses whatever span
    /// happens to be active on its worker thread.
    pub fn capture(&self, span: Option<Arc<dyn Span>>) -> Continuation {
        if let Some(span) = &span {
            span.inc_ref();
        }
        Continuation {
            inner: Some(ContinuationInner {
                scheduler: self.clone(),
                span,
                snapshot: self.inner.diagnostics.snapshot(),
                auto_finish: true,
            }),
        }
    }

    /// Captures whatever span is currently active on the calling thread.
    ///
    /// Shorthand for `self.capture(self.active())`.
    pub fn capture_active(&self) -> Continuation {
        self.capture(self.active())
    }

    fn install_frame(
        &self,
        span: Option<Arc<dyn Span>>,
        snapshot: DiagnosticSnapshot,
        auto_finish: bool,
        owns_ref: bool,
    ) -> ActiveHandle {
        let frame = ACTIVE_FRAMES.with(|slots| {
            let mut slots = slots.borrow_mut();
            let to_restore = slots.get(&self.inner.id).cloned();
            let frame = Rc::new(ActivationFrame {
                span,
                snapshot,
                auto_finish,
                to_restore,
            });
            slots.insert(self.inner.id, frame.clone());
            frame
        });
        // Applied after the slot borrow is released so diagnostic providers
        // may call back into the scheduler.
        self.inner.diagnostics.restore(&frame.snapshot);
        ActiveHandle {
            scheduler: self.clone(),
            frame,
            owns_ref,
            deactivated: false,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

/// One frame in a thread's activation chain.
///
/// `to_restore` is fixed at construction: frames are only created at
/// activation time, and the predecessor recorded then is never rewritten.
struct ActivationFrame {
    span: Option<Arc<dyn Span>>,
    snapshot: DiagnosticSnapshot,
    auto_finish: bool,
    to_restore: Option<Rc<ActivationFrame>>,
}

fn release_reference(span: &Option<Arc<dyn Span>>, auto_finish: bool) {
    if let Some(span) = span {
        if span.dec_ref() == 0 && auto_finish {
            span.finish();
        }
    }
}

/// A one-shot token that can make a captured span current in some execution
/// context.
///
/// Produced by [`Scheduler::capture`] and [`ActiveHandle::fork`]. The token
/// owns one reference on its span; [`activate`](Continuation::activate)
/// transfers that reference to the returned [`ActiveHandle`], and dropping
/// an unactivated continuation releases it, so a handoff that never runs
/// (a cancelled task, a dropped future) does not pin the span forever.
///
/// `Continuation` is `Send`: it exists to cross thread boundaries.
pub struct Continuation {
    inner: Option<ContinuationInner>,
}

struct ContinuationInner {
    scheduler: Scheduler,
    span: Option<Arc<dyn Span>>,
    snapshot: DiagnosticSnapshot,
    auto_finish: bool,
}

impl Continuation {
    /// Disables finish-on-last-release for this continuation and the frames
    /// and forks derived from it.
    ///
    /// Use this when something other than the activation machinery owns the
    /// span's end of life, for example when propagating a span that the
    /// originating request handler will finish itself.
    pub fn manual_finish(mut self) -> Self {
        if let Some(inner) = self.inner.as_mut() {
            inner.auto_finish = false;
        }
        self
    }

    /// Returns the span this continuation pins, if any.
    pub fn span(&self) -> Option<&Arc<dyn Span>> {
        self.inner.as_ref().and_then(|inner| inner.span.as_ref())
    }

    /// Makes the captured span current on the calling thread.
    ///
    /// Records the thread's current frame as the one to restore, installs a
    /// new frame on top of it, and reapplies the diagnostic state captured
    /// with the span. Consuming `self` is what makes the token one-shot: a
    /// second activation of the same continuation does not compile.
    pub fn activate(mut self) -> ActiveHandle {
        let inner = self
            .inner
            .take()
            .expect("continuation state consumed before activate");
        inner
            .scheduler
            .install_frame(inner.span, inner.snapshot, inner.auto_finish, true)
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            spanflow_debug!(name: "Continuation.DroppedUnactivated");
            release_reference(&inner.span, inner.auto_finish);
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Continuation");
        match &self.inner {
            Some(inner) => dbg
                .field("has_span", &inner.span.is_some())
                .field("auto_finish", &inner.auto_finish),
            None => dbg.field("consumed", &true),
        }
        .finish()
    }
}

/// The live result of activating a [`Continuation`].
///
/// Deactivate explicitly with [`deactivate`](ActiveHandle::deactivate), or
/// let the handle drop: the drop path runs the same deactivation, which is
/// what keeps the span accounting correct when the code under the handle
/// panics.
///
/// Handles are `!Send`. Activation state belongs to the thread that
/// installed it; to continue the span elsewhere, [`fork`](ActiveHandle::fork)
/// a new [`Continuation`] and send that instead.
pub struct ActiveHandle {
    scheduler: Scheduler,
    frame: Rc<ActivationFrame>,
    owns_ref: bool,
    deactivated: bool,
}

impl ActiveHandle {
    /// Returns the span this handle keeps active, if any.
    pub fn span(&self) -> Option<&Arc<dyn Span>> {
        self.frame.span.as_ref()
    }

    /// Mints a new [`Continuation`] over the same span for handoff to
    /// another execution context.
    ///
    /// Takes an additional reference on the span and snapshots the *current*
    /// diagnostic state (not the state captured when this handle's own
    /// continuation was built), so the receiving context inherits whatever
    /// was ambient at handoff time.
    pub fn fork(&self) -> Continuation {
        if let Some(span) = &self.frame.span {
            span.inc_ref();
        }
        Continuation {
            inner: Some(ContinuationInner {
                scheduler: self.scheduler.clone(),
                span: self.frame.span.clone(),
                snapshot: self.scheduler.inner.diagnostics.snapshot(),
                auto_finish: self.frame.auto_finish,
            }),
        }
    }

    /// Ends this active period.
    ///
    /// Releases the span reference this handle owns (finishing the span if
    /// it was the last one and auto-finish is in force), then restores the
    /// calling thread's slot to the nearest predecessor frame whose span is
    /// still unfinished, or clears it. If some other deactivation already
    /// superseded this frame the slot is left untouched; out-of-order
    /// deactivation across forks is an expected pattern, not an error.
    pub fn deactivate(mut self) {
        self.deactivate_impl();
    }

    fn deactivate_impl(&mut self) {
        if self.deactivated {
            return;
        }
        self.deactivated = true;

        if self.owns_ref {
            release_reference(&self.frame.span, self.frame.auto_finish);
        }

        // Walk past predecessors whose span already finished: a parent can
        // legitimately finish while handles forked from it are still live,
        // and its frame must never be reinstated. Runs without the
        // thread-local borrow held, since `is_finished` is caller code.
        let mut candidate = self.frame.to_restore.clone();
        loop {
            let next = match &candidate {
                Some(frame) if frame.span.as_ref().map_or(false, |span| span.is_finished()) => {
                    frame.to_restore.clone()
                }
                _ => break,
            };
            candidate = next;
        }

        let id = self.scheduler.inner.id;
        let restored = ACTIVE_FRAMES.with(|slots| {
            let mut slots = slots.borrow_mut();
            match slots.get(&id) {
                Some(top) if Rc::ptr_eq(top, &self.frame) => {
                    match &candidate {
                        Some(frame) => {
                            slots.insert(id, frame.clone());
                        }
                        None => {
                            slots.remove(&id);
                        }
                    }
                    true
                }
                _ => false,
            }
        });

        if !restored {
            spanflow_debug!(name: "ActiveHandle.SupersededDeactivate");
            return;
        }

        match &candidate {
            Some(frame) => self.scheduler.inner.diagnostics.restore(&frame.snapshot),
            None => self.scheduler.inner.diagnostics.clear(),
        }
    }
}

impl Drop for ActiveHandle {
    fn drop(&mut self) {
        self.deactivate_impl();
    }
}

impl fmt::Debug for ActiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveHandle")
            .field("has_span", &self.frame.span.is_some())
            .field("auto_finish", &self.frame.auto_finish)
            .field("deactivated", &self.deactivated)
            .finish()
    }
}

/// Scheduler ids are sequential counters; they hash to themselves.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("scheduler ids call write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}
