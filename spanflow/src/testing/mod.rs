//! In-memory collaborators for exercising span activation in tests.
//!
//! Not intended for production use.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::span::{Span, SpanState};
use crate::task::{Executor, ExecutorError};

/// A span that records its lifecycle in memory.
///
/// Tracks how many times the finish side effects actually ran (which must
/// never exceed one), exposes the live reference count, and optionally
/// reports its name to an [`mpsc`](std::sync::mpsc) sink on finish so tests
/// can assert on completion order across threads.
#[derive(Debug)]
pub struct TestSpan {
    name: Cow<'static, str>,
    state: SpanState,
    finish_calls: AtomicUsize,
    tags: Mutex<HashMap<String, String>>,
    sink: Option<Mutex<Sender<Cow<'static, str>>>>,
}

impl TestSpan {
    /// Creates an unfinished span with zero references.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        TestSpan {
            name: name.into(),
            state: SpanState::new(),
            finish_calls: AtomicUsize::new(0),
            tags: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Creates a span that sends its name to `sink` when it finishes.
    pub fn with_sink(name: impl Into<Cow<'static, str>>, sink: Sender<Cow<'static, str>>) -> Self {
        TestSpan {
            sink: Some(Mutex::new(sink)),
            ..TestSpan::new(name)
        }
    }

    /// The operation name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets a tag; spans stay mutable to any context holding a reference.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.tags
            .lock()
            .expect("TestSpan tags lock poisoned")
            .insert(key.into(), value.into());
    }

    /// Reads a tag back.
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .lock()
            .expect("TestSpan tags lock poisoned")
            .get(key)
            .cloned()
    }

    /// Number of times the finish side effects ran. At most one, always.
    pub fn finish_calls(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }

    /// Current reference count.
    pub fn refs(&self) -> usize {
        self.state.refs()
    }
}

impl Span for TestSpan {
    fn finish(&self) {
        if self.state.try_finish() {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(sink) = &self.sink {
                if let Ok(sender) = sink.lock() {
                    let _ = sender.send(self.name.clone());
                }
            }
        }
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

/// An [`Executor`] that runs each task on a dedicated thread.
///
/// [`join`](ThreadExecutor::join) waits for everything submitted so far,
/// swallowing worker panics so tests can assert on the state they left
/// behind.
#[derive(Debug, Default)]
pub struct ThreadExecutor {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ThreadExecutor {
    /// Creates an executor accepting tasks.
    pub fn new() -> Self {
        ThreadExecutor::default()
    }

    /// Stops accepting new tasks; already-running tasks are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Waits for every task submitted so far.
    pub fn join(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("ThreadExecutor handles lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), ExecutorError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ExecutorError::Shutdown);
        }
        let handle = std::thread::spawn(task);
        self.handles
            .lock()
            .expect("ThreadExecutor handles lock poisoned")
            .push(handle);
        Ok(())
    }
}
