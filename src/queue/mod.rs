//! Runs a worker over items pulled from a [`WorkQueue`].
//!
//! Items are processed by `WORKERS` concurrent workers racing for the
//! queue. [`ExecuteError::TryLater`] puts the same [`ExecuteContext`] back at
//! the end of the queue with its attempt number bumped; there is no delay
//! between attempts. A failure is delivered to whoever submitted the item,
//! and only brings the service down if nobody did. Workers exit after the
//! item in flight once the service is stopping; stopping the task closes the
//! queue and drops what is left in it.

mod work_queue;

pub use work_queue::{DuplicatePolicy, WorkQueue};

use std::{future::Future, hash::Hash, ops::Deref, sync::Arc, time::Duration};

use futures::future::join_all;

use crate::{
    context::{Completion, ExecuteContext},
    counters::{Aggregate, Counter, Samples},
    error::{CompletionError, QueueError},
    options::{OptionSpec, OptionValue},
    task::{
        ExecuteError, InitResult, Task, TaskContext, TaskDescriptor, TaskError, TaskResult,
        Worker,
    },
    timer::within,
};

/// How long a worker waits for an item before polling the queue again.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Windows, in seconds, of the `execute_duration_ms` series.
const DURATION_WINDOWS: [u64; 2] = [60, 240];

/// What a queue holds for worker `W`.
pub type Work<W> = ExecuteContext<<W as QueueWorker>::Item, <W as QueueWorker>::Output>;

/// A worker run by the [`QueueTask`] engine.
pub trait QueueWorker: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    const OPT_PREFIX: Option<&'static str> = None;

    /// Default of the `workers` option.
    const WORKERS: usize = 1;

    /// Default of the `max_items` option; 0 means unbounded.
    const MAX_ITEMS: usize = 0;

    type Item: Send + Sync + 'static;
    type Output: Send + 'static;

    fn deps() -> Vec<TaskDescriptor> {
        Vec::new()
    }

    fn options() -> Vec<OptionSpec> {
        Vec::new()
    }

    fn create(ctx: &TaskContext) -> Result<Self, TaskError>;

    /// Builds the queue. FIFO unless overridden, see [`priority_queue`] and
    /// [`unique_queue`].
    fn make_queue(max_items: usize) -> WorkQueue<Work<Self>> {
        WorkQueue::fifo(max_items)
    }

    fn init(&self) -> impl Future<Output = InitResult> + Send {
        async { Ok(()) }
    }

    fn execute(
        &self,
        item: &Self::Item,
        ctx: &Work<Self>,
    ) -> impl Future<Output = Result<Self::Output, ExecuteError>> + Send;

    fn stop(&self) {}
}

/// Smallest item first. Equal items come out in no guaranteed order.
pub fn priority_queue<W>(max_items: usize) -> WorkQueue<Work<W>>
where
    W: QueueWorker,
    W::Item: Ord,
{
    WorkQueue::priority(max_items)
}

/// FIFO refusing an item equal to one that is queued or still being
/// processed.
pub fn unique_queue<W>(max_items: usize, policy: DuplicatePolicy) -> WorkQueue<Work<W>>
where
    W: QueueWorker,
    W::Item: Hash + Eq + Clone,
{
    WorkQueue::unique_by(max_items, policy, true, |work: &Work<W>| {
        work.item().clone()
    })
}

/// Task running a [`QueueWorker`] over its own queue.
pub struct QueueTask<W: QueueWorker> {
    worker: W,
    ctx: TaskContext,
    queue: Arc<WorkQueue<Work<W>>>,
    workers: usize,
    n_completed: Arc<Counter>,
    n_try_later: Arc<Counter>,
    n_unhandled: Arc<Counter>,
    execute_duration_ms: Arc<Samples>,
}

impl<W: QueueWorker> QueueTask<W> {
    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn queue(&self) -> &WorkQueue<Work<W>> {
        &self.queue
    }

    pub fn completed(&self) -> u64 {
        self.n_completed.value().unwrap_or(0.0) as u64
    }

    pub fn retried(&self) -> u64 {
        self.n_try_later.value().unwrap_or(0.0) as u64
    }

    pub fn unhandled(&self) -> u64 {
        self.n_unhandled.value().unwrap_or(0.0) as u64
    }

    /// Queues `item` with nobody observing its result. If it fails, the
    /// service shuts down.
    pub async fn put(&self, item: W::Item) -> Result<(), QueueError> {
        self.queue.put(ExecuteContext::new(item)).await
    }

    /// Like [`QueueTask::put`], but fails instead of waiting for room.
    pub fn try_put(&self, item: W::Item) -> Result<(), QueueError> {
        self.queue.try_put(ExecuteContext::new(item))
    }

    /// Queues `item` and returns a handle to its result.
    ///
    /// The handle resolves with [`CompletionError::NotRunning`] if the task
    /// has stopped, and with [`CompletionError::Dropped`] if a
    /// duplicate-suppressing queue refused or dropped the item.
    pub async fn submit(&self, item: W::Item) -> Completion<W::Output> {
        let (sink, completion) = Completion::channel();
        match self.queue.put(ExecuteContext::with_sink(item, sink)).await {
            Ok(()) => completion,
            Err(QueueError::Closed) => Completion::failed(CompletionError::NotRunning),
            Err(QueueError::Duplicate | QueueError::Full) => completion,
        }
    }

    /// Submits every item and collects their results in order.
    ///
    /// Fails with the first error among the results, or with
    /// [`CompletionError::Timeout`] if they are not all in within `timeout`.
    pub async fn map<I>(
        &self,
        items: I,
        timeout: Option<Duration>,
    ) -> Result<Vec<W::Output>, CompletionError>
    where
        I: IntoIterator<Item = W::Item>,
    {
        let mut completions = Vec::new();
        for item in items {
            completions.push(self.submit(item).await);
        }
        let results = within(timeout, join_all(completions))
            .await
            .ok_or(CompletionError::Timeout(timeout.unwrap_or_default()))?;
        results.into_iter().collect()
    }

    /// Waits until every queued item has been processed.
    pub async fn join(&self) {
        self.queue.join().await
    }

    async fn process(&self, mut work: Work<W>) -> TaskResult {
        work.start();
        match self.worker.execute(work.item(), &work).await {
            Ok(output) => {
                self.n_completed.increment();
                self.execute_duration_ms.add(work.elapsed().as_secs_f64() * 1000.0);
                work.succeed(output);
                self.queue.release(&work);
            }
            Err(ExecuteError::TryLater(_)) => {
                self.n_try_later.increment();
                work.retry();
                tracing::debug!(attempt = work.attempt(), "Retrying item");
                self.queue.release(&work);
                if let Err(err) = self.queue.put(work).await {
                    tracing::warn!(error = %err, "Unable to queue item again, dropping it");
                }
            }
            Err(ExecuteError::Failed(err)) => {
                self.n_unhandled.increment();
                self.execute_duration_ms.add(work.elapsed().as_secs_f64() * 1000.0);
                let delivered = work.fail(err);
                self.queue.release(&work);
                delivered?;
            }
        }
        Ok(())
    }
}

impl<W: QueueWorker> Deref for QueueTask<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

impl<W: QueueWorker> Task for QueueTask<W> {
    const NAME: &'static str = W::NAME;
    const OPT_PREFIX: Option<&'static str> = W::OPT_PREFIX;
    const WORKERS: usize = W::WORKERS;

    fn deps() -> Vec<TaskDescriptor> {
        W::deps()
    }

    fn options() -> Vec<OptionSpec> {
        let mut options = W::options();
        options.push(
            OptionSpec::int("max_items")
                .with_late_default(|| Some(OptionValue::from(W::MAX_ITEMS)))
                .with_help("Queue capacity, 0 for unbounded"),
        );
        options.push(
            OptionSpec::int("workers")
                .with_late_default(|| Some(OptionValue::from(W::WORKERS)))
                .with_help("Number of concurrent workers"),
        );
        options
    }

    fn create(ctx: TaskContext) -> Result<Self, TaskError> {
        let max_items = ctx.option_usize("max_items")?.unwrap_or(W::MAX_ITEMS);
        let workers = ctx.option_usize("workers")?.unwrap_or(W::WORKERS).max(1);
        let queue = Arc::new(W::make_queue(max_items));

        let counters = ctx.counters();
        let n_completed = counters.sum("n_completed");
        let n_try_later = counters.sum("n_trylater");
        let n_unhandled = counters.sum("n_unhandled");
        let depth = queue.clone();
        counters.callback("queue_depth", move || Some(depth.len() as f64));
        let execute_duration_ms = counters.samples(
            "execute_duration_ms",
            &[Aggregate::Average, Aggregate::Max, Aggregate::Min],
            &DURATION_WINDOWS,
        );

        Ok(Self {
            worker: W::create(&ctx)?,
            ctx,
            queue,
            workers,
            n_completed,
            n_try_later,
            n_unhandled,
            execute_duration_ms,
        })
    }

    async fn init(&self) -> InitResult {
        self.worker.init().await
    }

    fn workers(&self) -> usize {
        self.workers
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        while !self.ctx.is_stopping() {
            let work = match self.queue.get_timeout(POLL_TIMEOUT).await {
                Ok(Some(work)) => work,
                Ok(None) => continue,
                Err(QueueError::Closed) => break,
                Err(err) => return Err(err.into()),
            };
            if self.ctx.is_stopping() {
                // Abandoned; a submitter sees `Dropped`.
                self.queue.release(&work);
                self.queue.task_done();
                break;
            }
            let result = self.process(work).await;
            self.queue.task_done();
            result?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
        self.queue.close();
        let abandoned = self.queue.clear();
        if abandoned > 0 {
            tracing::info!(parent: self.ctx.span(), abandoned, "Dropping queued items");
        }
    }
}
