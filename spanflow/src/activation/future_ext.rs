use crate::activation::{ActiveHandle, Continuation, Scheduler};
use futures_core::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

impl Continuation {
    /// Installs a frame for this continuation without consuming it and
    /// without transferring its span reference. Poll-scoped activation uses
    /// this so one continuation can cover many polls; the continuation's
    /// single reference is released separately, when the wrapped work ends.
    fn enter(&self) -> ActiveHandle {
        let inner = self
            .inner
            .as_ref()
            .expect("continuation state consumed before enter");
        inner.scheduler.install_frame(
            inner.span.clone(),
            inner.snapshot.clone(),
            inner.auto_finish,
            false,
        )
    }

    /// Consumes the continuation and releases its span reference. This is
    /// the normal completion path for poll-scoped activation, where the
    /// reference is owned by the continuation rather than any per-poll frame.
    fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            super::release_reference(&inner.span, inner.auto_finish);
        }
    }
}

pin_project! {
    /// A future, stream, or sink whose span is re-activated around every poll.
    ///
    /// The pinned span reference is released when the future completes, when
    /// the stream ends or the sink closes, or when the wrapper is dropped,
    /// whichever comes first.
    #[derive(Debug)]
    pub struct WithSpan<T> {
        #[pin]
        inner: T,
        continuation: Option<Continuation>,
    }
}

impl<T: std::future::Future> std::future::Future for WithSpan<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll = match this.continuation.as_ref() {
            Some(continuation) => {
                let _guard = continuation.enter();
                this.inner.poll(task_cx)
            }
            None => this.inner.poll(task_cx),
        };
        if poll.is_ready() {
            // Completion ends this execution context's claim on the span.
            if let Some(continuation) = this.continuation.take() {
                continuation.release();
            }
        }
        poll
    }
}

impl<T: Stream> Stream for WithSpan<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let poll = match this.continuation.as_ref() {
            Some(continuation) => {
                let _guard = continuation.enter();
                this.inner.poll_next(task_cx)
            }
            None => this.inner.poll_next(task_cx),
        };
        if matches!(poll, Poll::Ready(None)) {
            if let Some(continuation) = this.continuation.take() {
                continuation.release();
            }
        }
        poll
    }
}

impl<I, T: Sink<I>> Sink<I> for WithSpan<T> {
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.continuation.as_ref().map(Continuation::enter);
        T::poll_ready(this.inner, task_cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _guard = this.continuation.as_ref().map(Continuation::enter);
        T::start_send(this.inner, item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.continuation.as_ref().map(Continuation::enter);
        T::poll_flush(this.inner, task_cx)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let poll = {
            let _guard = this.continuation.as_ref().map(Continuation::enter);
            T::poll_close(this.inner, task_cx)
        };
        if poll.is_ready() {
            if let Some(continuation) = this.continuation.take() {
                continuation.release();
            }
        }
        poll
    }
}

impl<F: std::future::Future> FutureSpanExt for F {}
/// Extension trait allowing futures to carry an active span.
pub trait FutureSpanExt: Sized {
    /// Associates `continuation`'s span with this future, returning a
    /// [`WithSpan`] wrapper.
    ///
    /// The span will be active on whichever thread polls the future, for
    /// the duration of each poll.
    fn with_continuation(self, continuation: Continuation) -> WithSpan<Self> {
        WithSpan {
            inner: self,
            continuation: Some(continuation),
        }
    }

    /// Captures `scheduler`'s currently active span and associates it with
    /// this future, returning a [`WithSpan`] wrapper.
    fn with_active_span(self, scheduler: &Scheduler) -> WithSpan<Self> {
        self.with_continuation(scheduler.capture_active())
    }
}

impl<S: Stream> StreamSpanExt for S {}
/// Extension trait allowing streams to carry an active span.
pub trait StreamSpanExt: Sized {
    /// Associates `continuation`'s span with this stream, returning a
    /// [`WithSpan`] wrapper.
    ///
    /// The span will be active while each item is polled out of the stream.
    fn with_continuation(self, continuation: Continuation) -> WithSpan<Self> {
        WithSpan {
            inner: self,
            continuation: Some(continuation),
        }
    }

    /// Captures `scheduler`'s currently active span and associates it with
    /// this stream, returning a [`WithSpan`] wrapper.
    fn with_active_span(self, scheduler: &Scheduler) -> WithSpan<Self> {
        self.with_continuation(scheduler.capture_active())
    }
}

impl<_I, S: Sink<_I>> SinkSpanExt<_I> for S {}
/// Extension trait allowing sinks to carry an active span.
///
/// The generic argument is unused.
pub trait SinkSpanExt<_I>: Sized {
    /// Associates `continuation`'s span with this sink, returning a
    /// [`WithSpan`] wrapper.
    ///
    /// The span will be active while the sink is polled.
    fn with_continuation(self, continuation: Continuation) -> WithSpan<Self> {
        WithSpan {
            inner: self,
            continuation: Some(continuation),
        }
    }

    /// Captures `scheduler`'s currently active span and associates it with
    /// this sink, returning a [`WithSpan`] wrapper.
    fn with_active_span(self, scheduler: &Scheduler) -> WithSpan<Self> {
        self.with_continuation(scheduler.capture_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use crate::testing::TestSpan;
    use std::sync::Arc;

    fn as_dyn(span: &Arc<TestSpan>) -> Arc<dyn Span> {
        span.clone()
    }

    #[test]
    fn span_active_during_poll_released_on_ready() {
        let scheduler = Scheduler::new();
        let span = Arc::new(TestSpan::new("polled"));
        let handle = scheduler.capture(Some(as_dyn(&span))).activate();

        let fut = {
            let scheduler = scheduler.clone();
            let span = span.clone();
            async move {
                let active = scheduler.active().expect("span should be active in poll");
                assert!(Arc::ptr_eq(&active, &as_dyn(&span)));
            }
        }
        .with_active_span(&scheduler);

        // The originating scope ends before the future runs; its reference
        // keeps the span alive until the future completes.
        handle.deactivate();
        assert!(!span.is_finished());

        futures_executor::block_on(fut);
        assert!(span.is_finished());
        assert_eq!(span.finish_calls(), 1);
        assert!(scheduler.active().is_none());
    }

    #[test]
    fn dropping_unpolled_future_releases_reference() {
        let scheduler = Scheduler::new();
        let span = Arc::new(TestSpan::new("cancelled"));
        let handle = scheduler.capture(Some(as_dyn(&span))).activate();

        let fut = async {}.with_active_span(&scheduler);
        handle.deactivate();
        assert!(!span.is_finished());

        drop(fut);
        assert!(span.is_finished());
        assert_eq!(span.finish_calls(), 1);
    }

    #[test]
    fn stream_releases_on_end() {
        use futures_util::StreamExt as _;

        let scheduler = Scheduler::new();
        let span = Arc::new(TestSpan::new("streamed"));
        let continuation = scheduler.capture(Some(as_dyn(&span)));

        let stream = StreamSpanExt::with_continuation(
            futures_util::stream::iter(vec![1_u32, 2, 3]),
            continuation,
        );
        let collected: Vec<u32> = futures_executor::block_on(stream.collect());
        assert_eq!(collected, vec![1, 2, 3]);
        assert!(span.is_finished());
    }
}
