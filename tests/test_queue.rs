mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{start, stop};
use taskhost::{
    unique_queue, CompletionError, DuplicatePolicy, ExecuteError, QueueError, QueueTask,
    QueueWorker, ServiceBuilder, ServiceStatus, TaskContext, Work, WorkQueue,
};

struct Doubler;

impl QueueWorker for Doubler {
    const NAME: &'static str = "Doubler";
    const WORKERS: usize = 2;
    type Item = u64;
    type Output = u64;

    fn create(_ctx: &TaskContext) -> anyhow::Result<Self> {
        Ok(Doubler)
    }

    async fn execute(&self, item: &u64, ctx: &Work<Self>) -> Result<u64, ExecuteError> {
        if ctx.attempt() <= 10 {
            return Err(ExecuteError::try_later());
        }
        Ok(item * 2)
    }
}

#[tokio::test]
async fn test_try_later_requeues_until_done() {
    let definition = ServiceBuilder::new("queue")
        .with_task::<QueueTask<Doubler>>()
        .build();

    let runner = start(&definition).await;
    let doubler = runner.service().require::<QueueTask<Doubler>>().unwrap();

    let results = doubler
        .map([1, 2, 3], Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(results, [2, 4, 6]);
    assert_eq!(doubler.retried(), 30);
    assert_eq!(doubler.completed(), 3);
    assert_eq!(doubler.unhandled(), 0);

    let counters = runner.service().all_counters();
    assert_eq!(counters["Doubler.n_trylater"], Some(30.0));
    assert_eq!(counters["Doubler.n_completed"], Some(3.0));

    stop(runner).await;
}

struct Picky;

impl QueueWorker for Picky {
    const NAME: &'static str = "Picky";
    type Item = u64;
    type Output = u64;

    fn create(_ctx: &TaskContext) -> anyhow::Result<Self> {
        Ok(Picky)
    }

    async fn execute(&self, item: &u64, _ctx: &Work<Self>) -> Result<u64, ExecuteError> {
        if *item == 0 {
            return Err(anyhow::anyhow!("zero is not allowed").into());
        }
        Ok(*item)
    }
}

#[tokio::test]
async fn test_observed_failure_goes_to_the_submitter() {
    let definition = ServiceBuilder::new("queue")
        .with_task::<QueueTask<Picky>>()
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    let picky = service.require::<QueueTask<Picky>>().unwrap();

    match picky.submit(0).await.await {
        Err(CompletionError::Failed(err)) => assert_eq!(err.to_string(), "zero is not allowed"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(picky.unhandled(), 1);
    assert_eq!(picky.submit(5).await.await.unwrap(), 5);
    assert!(!service.is_stopping());
    assert_eq!(service.status(), ServiceStatus::Alive);

    stop(runner).await;
}

#[tokio::test]
async fn test_unobserved_failure_shuts_service_down() {
    let definition = ServiceBuilder::new("queue")
        .with_task::<QueueTask<Picky>>()
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    let picky = service.require::<QueueTask<Picky>>().unwrap();

    picky.put(0).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), runner.wait())
        .await
        .expect("service did not shut down")
        .unwrap();
    assert_eq!(service.status(), ServiceStatus::Stopped);

    assert!(matches!(
        picky.submit(1).await.await,
        Err(CompletionError::NotRunning)
    ));
    assert_eq!(picky.put(1).await, Err(QueueError::Closed));
}

static SLOW_DONE: AtomicUsize = AtomicUsize::new(0);

struct Slow;

impl QueueWorker for Slow {
    const NAME: &'static str = "Slow";
    const WORKERS: usize = 2;
    type Item = u64;
    type Output = u64;

    fn create(_ctx: &TaskContext) -> anyhow::Result<Self> {
        Ok(Slow)
    }

    async fn execute(&self, item: &u64, _ctx: &Work<Self>) -> Result<u64, ExecuteError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        SLOW_DONE.fetch_add(1, Ordering::SeqCst);
        Ok(*item)
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_the_backlog() {
    let definition = ServiceBuilder::new("queue")
        .with_task::<QueueTask<Slow>>()
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    let slow = service.require::<QueueTask<Slow>>().unwrap();

    let mut completions = Vec::new();
    for item in 0..40 {
        completions.push(slow.submit(item).await);
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
    let done_at_shutdown = SLOW_DONE.load(Ordering::SeqCst);
    stop(runner).await;

    let done_after_stop = SLOW_DONE.load(Ordering::SeqCst) - done_at_shutdown;
    assert!(
        done_after_stop <= Slow::WORKERS,
        "{done_after_stop} items completed after the stop"
    );
    let last = completions.pop().unwrap();
    assert!(matches!(last.await, Err(CompletionError::Dropped)));
    assert!(slow.queue().is_empty());
    assert_eq!(slow.queue().unfinished(), 0);
}

#[tokio::test]
async fn test_clear_marks_items_done() {
    let queue = WorkQueue::fifo(3);
    queue.try_put(1).unwrap();
    queue.try_put(2).unwrap();
    queue.try_put(3).unwrap();
    assert_eq!(queue.clear(), 3);
    assert!(queue.is_empty());
    assert_eq!(queue.unfinished(), 0);

    queue.try_put(4).unwrap();
    assert_eq!(queue.get_timeout(Duration::from_millis(10)).await, Ok(Some(4)));
    assert_eq!(queue.get_timeout(Duration::from_millis(10)).await, Ok(None));
}

struct Dedup;

impl QueueWorker for Dedup {
    const NAME: &'static str = "Dedup";
    const MAX_ITEMS: usize = 10;
    type Item = u64;
    type Output = u64;

    fn create(_ctx: &TaskContext) -> anyhow::Result<Self> {
        Ok(Dedup)
    }

    fn make_queue(max_items: usize) -> WorkQueue<Work<Self>> {
        unique_queue::<Self>(max_items, DuplicatePolicy::Reject)
    }

    async fn execute(&self, item: &u64, _ctx: &Work<Self>) -> Result<u64, ExecuteError> {
        Ok(*item)
    }
}

#[tokio::test]
async fn test_queue_options_and_depth() {
    let definition = ServiceBuilder::new("queue")
        .with_task::<QueueTask<Dedup>>()
        .build();
    let options = definition.options().unwrap();
    assert_eq!(
        options.get("Dedup_max_items").unwrap().and_then(|v| v.as_i64()),
        Some(10)
    );
    options.set("Dedup_workers", 3_i64).unwrap();
    options.set("Dedup_max_items", 4_i64).unwrap();

    let service = definition.create(options).await.unwrap();
    let dedup = service.require::<QueueTask<Dedup>>().unwrap();
    assert_eq!(dedup.queue().max_items(), 4);
    let handle = service.require_task("Dedup").unwrap();
    assert_eq!(handle.workers().len(), 3);

    dedup.try_put(1).unwrap();
    dedup.try_put(2).unwrap();
    assert_eq!(dedup.try_put(2), Err(QueueError::Duplicate));
    dedup.try_put(3).unwrap();
    dedup.try_put(4).unwrap();
    assert_eq!(dedup.try_put(5), Err(QueueError::Full));
    assert_eq!(service.counter("Dedup.queue_depth"), Some(4.0));
}

#[tokio::test]
async fn test_duplicate_submission_is_dropped() {
    let definition = ServiceBuilder::new("queue")
        .with_task::<QueueTask<Dedup>>()
        .build();

    let service = definition
        .create(definition.options().unwrap())
        .await
        .unwrap();
    let dedup = service.require::<QueueTask<Dedup>>().unwrap();

    let _first = dedup.submit(7).await;
    let second = dedup.submit(7).await;
    assert!(matches!(second.await, Err(CompletionError::Dropped)));

    let nobody_working = dedup.map([8], Some(Duration::from_millis(50))).await;
    assert!(matches!(
        nobody_working,
        Err(CompletionError::Timeout(timeout)) if timeout == Duration::from_millis(50)
    ));
}

#[tokio::test]
async fn test_priority_queue_hands_out_smallest_first() {
    let queue = WorkQueue::priority(0);
    for item in [5, 1, 3] {
        queue.put(item).await.unwrap();
    }
    assert_eq!(queue.get().await, Ok(1));
    assert_eq!(queue.get().await, Ok(3));
    assert_eq!(queue.get().await, Ok(5));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_unique_queue_policies() {
    let dropping = WorkQueue::unique(0, DuplicatePolicy::Drop);
    dropping.put("a").await.unwrap();
    dropping.put("a").await.unwrap();
    assert_eq!(dropping.len(), 1);
    assert_eq!(dropping.get().await, Ok("a"));
    dropping.put("a").await.unwrap();
    assert_eq!(dropping.len(), 1);

    let rejecting = WorkQueue::unique_by(0, DuplicatePolicy::Reject, true, |item: &u32| *item);
    rejecting.put(1).await.unwrap();
    assert_eq!(rejecting.get().await, Ok(1));
    assert_eq!(rejecting.put(1).await, Err(QueueError::Duplicate));
    rejecting.release(&1);
    rejecting.put(1).await.unwrap();
    assert_eq!(rejecting.unfinished(), 2);
}

#[tokio::test]
async fn test_bounded_queue_refuses_when_full() {
    let queue = WorkQueue::fifo(2);
    queue.try_put(1).unwrap();
    queue.try_put(2).unwrap();
    assert_eq!(queue.try_put(3), Err(QueueError::Full));

    assert_eq!(queue.get().await, Ok(1));
    queue.try_put(3).unwrap();
    assert_eq!(queue.get_timeout(Duration::from_millis(10)).await, Ok(Some(2)));
    assert_eq!(queue.get_timeout(Duration::from_millis(10)).await, Ok(Some(3)));
    assert_eq!(queue.get_timeout(Duration::from_millis(10)).await, Ok(None));
}

#[tokio::test]
async fn test_closed_queue_drains_then_reports_closed() {
    let queue = WorkQueue::fifo(0);
    queue.put(1).await.unwrap();
    queue.put(2).await.unwrap();
    queue.close();

    assert_eq!(queue.put(3).await, Err(QueueError::Closed));
    assert_eq!(queue.get().await, Ok(1));
    assert_eq!(queue.get().await, Ok(2));
    assert_eq!(queue.get().await, Err(QueueError::Closed));
}

#[tokio::test]
async fn test_join_waits_for_task_done() {
    let queue = Arc::new(WorkQueue::fifo(0));
    queue.put(1).await.unwrap();
    queue.put(2).await.unwrap();
    assert_eq!(queue.unfinished(), 2);

    let consumer = queue.clone();
    tokio::spawn(async move {
        while let Ok(Some(_)) = consumer.get_timeout(Duration::from_millis(100)).await {
            consumer.task_done();
        }
    });

    tokio::time::timeout(Duration::from_secs(5), queue.join())
        .await
        .expect("queue was not drained");
    assert_eq!(queue.unfinished(), 0);
}
