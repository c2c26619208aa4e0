//! Ambient diagnostic context captured and restored alongside span activation.
//!
//! Logging setups often keep a per-thread key/value map (a "mapped diagnostic
//! context") that downstream log statements pick up implicitly. When a span is
//! handed to another thread, that map has to travel with it or the receiving
//! thread logs with the wrong ambient state. The scheduler snapshots the
//! diagnostic context at capture/fork time and reapplies it at activation
//! through the [`DiagnosticContext`] trait; the map implementation itself is
//! pluggable.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::spanflow_warn;

/// An opaque, immutable snapshot of a [`DiagnosticContext`]'s per-thread state.
///
/// Snapshots are shared between a continuation and every frame it produces,
/// and may be reapplied on a different thread than the one that captured them.
pub type DiagnosticSnapshot = Arc<dyn Any + Send + Sync>;

/// Provider of ambient per-thread diagnostic state.
///
/// The scheduler calls [`snapshot`](DiagnosticContext::snapshot) when a span
/// is captured or forked, [`restore`](DiagnosticContext::restore) when a
/// frame becomes current, and [`clear`](DiagnosticContext::clear) when
/// deactivation leaves no frame behind.
pub trait DiagnosticContext: fmt::Debug + Send + Sync {
    /// Captures the calling thread's diagnostic state.
    fn snapshot(&self) -> DiagnosticSnapshot;

    /// Replaces the calling thread's diagnostic state with `snapshot`.
    fn restore(&self, snapshot: &DiagnosticSnapshot);

    /// Clears the calling thread's diagnostic state.
    fn clear(&self);
}

/// A diagnostic provider that carries no state.
///
/// This is the default for schedulers built with
/// [`Scheduler::new`](crate::activation::Scheduler::new).
#[derive(Clone, Debug, Default)]
pub struct NoopDiagnosticContext;

impl DiagnosticContext for NoopDiagnosticContext {
    fn snapshot(&self) -> DiagnosticSnapshot {
        Arc::new(())
    }

    fn restore(&self, _snapshot: &DiagnosticSnapshot) {}

    fn clear(&self) {}
}

thread_local! {
    static CURRENT_MAP: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// A thread-local mapped diagnostic context.
///
/// Values put on one thread travel with captured continuations: activating a
/// continuation on another thread replaces that thread's map with the
/// snapshot, and deactivation restores whatever the prior frame carried.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use spanflow::activation::Scheduler;
/// use spanflow::diagnostic::MappedDiagnosticContext;
///
/// let scheduler = Scheduler::with_diagnostics(Arc::new(MappedDiagnosticContext::new()));
///
/// MappedDiagnosticContext::put("request_id", "r-17");
/// let continuation = scheduler.capture(None);
///
/// let worker = std::thread::spawn(move || {
///     let handle = continuation.activate();
///     assert_eq!(
///         MappedDiagnosticContext::get("request_id").as_deref(),
///         Some("r-17"),
///     );
///     handle.deactivate();
/// });
/// worker.join().unwrap();
/// ```
#[derive(Clone, Debug, Default)]
pub struct MappedDiagnosticContext;

impl MappedDiagnosticContext {
    /// Creates a provider over the calling process's thread-local maps.
    pub fn new() -> Self {
        MappedDiagnosticContext
    }

    /// Associates `value` with `key` on the calling thread.
    pub fn put(key: impl Into<String>, value: impl Into<String>) {
        CURRENT_MAP.with(|map| map.borrow_mut().insert(key.into(), value.into()));
    }

    /// Returns the value associated with `key` on the calling thread.
    pub fn get(key: &str) -> Option<String> {
        CURRENT_MAP.with(|map| map.borrow().get(key).cloned())
    }

    /// Removes `key` from the calling thread's map.
    pub fn remove(key: &str) {
        CURRENT_MAP.with(|map| map.borrow_mut().remove(key));
    }
}

impl DiagnosticContext for MappedDiagnosticContext {
    fn snapshot(&self) -> DiagnosticSnapshot {
        Arc::new(CURRENT_MAP.with(|map| map.borrow().clone()))
    }

    fn restore(&self, snapshot: &DiagnosticSnapshot) {
        match snapshot.downcast_ref::<HashMap<String, String>>() {
            Some(values) => CURRENT_MAP.with(|map| map.borrow_mut().clone_from(values)),
            None => {
                // A snapshot from a different provider ended up here; drop it
                // rather than guess at its contents.
                spanflow_warn!(name: "DiagnosticContext.SnapshotTypeMismatch");
            }
        }
    }

    fn clear(&self) {
        CURRENT_MAP.with(|map| map.borrow_mut().clear());
    }
}
