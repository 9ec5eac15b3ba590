//! Per-unit-of-work bookkeeping shared by the periodic and queue engines.

use std::{
    cmp::Ordering,
    fmt,
    future::Future,
    hash::{Hash, Hasher},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::sync::oneshot;

use crate::{error::CompletionError, timer::Timer};

/// Receiving side of an asynchronous execution result.
///
/// Await it directly, or use [`Completion::wait_timeout`] to bound the wait.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<O> {
    rx: oneshot::Receiver<Result<O, CompletionError>>,
}

/// Sending side of a [`Completion`].
pub struct CompletionSink<O> {
    tx: oneshot::Sender<Result<O, CompletionError>>,
}

impl<O> Completion<O> {
    pub fn channel() -> (CompletionSink<O>, Completion<O>) {
        let (tx, rx) = oneshot::channel();
        (CompletionSink { tx }, Completion { rx })
    }

    /// A completion that is already resolved with `error`.
    pub fn failed(error: CompletionError) -> Self {
        let (sink, completion) = Self::channel();
        sink.fail(error);
        completion
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<O, CompletionError> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(timeout)),
        }
    }
}

impl<O> Future for Completion<O> {
    type Output = Result<O, CompletionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(CompletionError::Dropped)))
    }
}

impl<O> CompletionSink<O> {
    /// Delivers `value`. Returns false if nobody is waiting for it.
    pub fn succeed(self, value: O) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Delivers `error`. Returns false if nobody is waiting for it.
    pub fn fail(self, error: CompletionError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// True while the matching [`Completion`] is still held by someone.
    pub fn is_observed(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// One unit of work: the item, how many times it has been attempted, how
/// long the current attempt has been running, and where its result goes.
///
/// Contexts compare, order and hash by their item, so a priority or
/// duplicate-suppressing queue of contexts behaves like one of items.
pub struct ExecuteContext<I, O> {
    attempt: u32,
    item: I,
    timer: Timer,
    sink: Option<CompletionSink<O>>,
    raw: bool,
}

impl<I, O> ExecuteContext<I, O> {
    /// Wraps a bare item; its result is not observed by anyone.
    pub fn new(item: I) -> Self {
        Self {
            attempt: 1,
            item,
            timer: Timer::new(),
            sink: None,
            raw: true,
        }
    }

    /// Wraps `item` together with the sink its result is delivered to.
    pub fn with_sink(item: I, sink: CompletionSink<O>) -> Self {
        Self {
            attempt: 1,
            item,
            timer: Timer::new(),
            sink: Some(sink),
            raw: false,
        }
    }

    /// Starts at 1 and grows by one on every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn item(&self) -> &I {
        &self.item
    }

    pub fn into_item(self) -> I {
        self.item
    }

    /// Time spent in the current attempt.
    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }

    /// True if the item was queued bare, without a completion handle.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub(crate) fn start(&mut self) {
        self.timer.start();
    }

    pub(crate) fn retry(&mut self) {
        self.attempt += 1;
    }

    /// Delivers the result; false if nobody observes it.
    pub(crate) fn succeed(&mut self, value: O) -> bool {
        self.timer.stop();
        self.sink.take().is_some_and(|sink| sink.succeed(value))
    }

    /// Delivers the failure, handing `error` back if nobody observes it.
    pub(crate) fn fail(&mut self, error: anyhow::Error) -> Result<(), anyhow::Error> {
        self.timer.stop();
        let Some(sink) = self.sink.take() else {
            return Err(error);
        };
        let error = Arc::new(error);
        let delivered = sink.fail(CompletionError::Failed(error.clone()));
        if delivered {
            Ok(())
        } else {
            Err(unshare(error))
        }
    }
}

/// Recovers an owned error from a shared one, copying the message if the
/// error is still shared.
pub(crate) fn unshare(error: Arc<anyhow::Error>) -> anyhow::Error {
    Arc::try_unwrap(error).unwrap_or_else(|shared| anyhow::anyhow!("{shared:#}"))
}

impl<I: fmt::Debug, O> fmt::Debug for ExecuteContext<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteContext")
            .field("attempt", &self.attempt)
            .field("item", &self.item)
            .finish()
    }
}

impl<I: PartialEq, O> PartialEq for ExecuteContext<I, O> {
    fn eq(&self, other: &Self) -> bool {
        self.item == other.item
    }
}

impl<I: Eq, O> Eq for ExecuteContext<I, O> {}

impl<I: PartialOrd, O> PartialOrd for ExecuteContext<I, O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.item.partial_cmp(&other.item)
    }
}

impl<I: Ord, O> Ord for ExecuteContext<I, O> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item.cmp(&other.item)
    }
}

impl<I: Hash, O> Hash for ExecuteContext<I, O> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.item.hash(state);
    }
}
