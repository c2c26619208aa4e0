//! Utilities for working with the process-default scheduler.
//!
//! The global scheduler **gives library code access to the application's
//! configured [`Scheduler`] without threading references through every
//! call**. The traced task and executor wrappers default to it when no
//! scheduler is supplied.
//!
//! It is a default registry, not the propagation mechanism itself: code that
//! wants isolation (tests especially) constructs its own [`Scheduler`]
//! instances and passes them explicitly.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use spanflow::diagnostic::MappedDiagnosticContext;
//! use spanflow::activation::Scheduler;
//! use spanflow::global;
//!
//! fn init_tracing() {
//!     // Configure the process-wide scheduler when your app starts (there
//!     // is a context-free default if this is never called).
//!     let scheduler = Scheduler::with_diagnostics(Arc::new(MappedDiagnosticContext::new()));
//!     let _ = global::set_scheduler(scheduler);
//! }
//!
//! fn do_something_tracked() {
//!     // Then any code in the process can reach the same scheduler.
//!     let scheduler = global::scheduler();
//!     let _continuation = scheduler.capture_active();
//! }
//!
//! init_tracing();
//! do_something_tracked();
//! ```

use std::mem;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::activation::Scheduler;
use crate::spanflow_debug;

/// The global `Scheduler` singleton.
static GLOBAL_SCHEDULER: Lazy<RwLock<Scheduler>> = Lazy::new(|| RwLock::new(Scheduler::new()));

/// Returns a clone of the currently configured global [`Scheduler`].
pub fn scheduler() -> Scheduler {
    GLOBAL_SCHEDULER
        .read()
        .expect("GLOBAL_SCHEDULER RwLock poisoned")
        .clone()
}

/// Sets `new_scheduler` as the global scheduler.
///
/// Returns the previously mounted instance (the built-in default if nothing
/// was set before). Spans already propagating under the old scheduler keep
/// working: continuations carry their scheduler with them.
pub fn set_scheduler(new_scheduler: Scheduler) -> Scheduler {
    let mut scheduler = GLOBAL_SCHEDULER
        .write()
        .expect("GLOBAL_SCHEDULER RwLock poisoned");
    spanflow_debug!(name: "GlobalScheduler.Set");
    mem::replace(&mut *scheduler, new_scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::NoopSpan;
    use std::sync::Arc;

    #[test]
    fn replacing_the_global_scheduler_preserves_old_state() {
        let replacement = Scheduler::new();
        let previous = set_scheduler(replacement.clone());

        // The old instance still works independently.
        let handle = previous.capture(Some(Arc::new(NoopSpan::new()))).activate();
        assert!(previous.active().is_some());
        assert!(scheduler().active().is_none());
        handle.deactivate();

        set_scheduler(previous);
    }
}
