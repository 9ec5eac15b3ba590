mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use common::{eventually, start, stop, EventLog, Idle};
use taskhost::{
    InitError, InitResult, ServiceBuilder, ServiceError, ServiceStatus, Task, TaskContext,
    TaskDescriptor, TaskResult, TaskState, Worker,
};

struct Skipper;

impl Task for Skipper {
    const NAME: &'static str = "Skipper";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Skipper)
    }

    async fn init(&self) -> InitResult {
        Err(InitError::skip("nothing to do on this host"))
    }
}

#[tokio::test]
async fn test_skipped_task_is_left_out() {
    let log = EventLog::default();
    let definition = log
        .attach(
            ServiceBuilder::new("lifecycle")
                .with_task::<Skipper>()
                .with_task::<Idle>(),
        )
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    assert_eq!(service.task_names(), ["Idle"]);
    assert!(service.get::<Skipper>().is_none());
    assert_eq!(service.task_state("Idle"), Some(TaskState::Running));
    assert!(log
        .filtered(&[TaskState::Skipped])
        .contains(&("Skipper", TaskState::Skipped)));

    stop(runner).await;
}

static HEALTHY_RUNS: AtomicUsize = AtomicUsize::new(0);

struct BrokenDisk;

impl Task for BrokenDisk {
    const NAME: &'static str = "BrokenDisk";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(BrokenDisk)
    }

    async fn init(&self) -> InitResult {
        Err(anyhow::anyhow!("disk full").into())
    }
}

struct BrokenNetwork;

impl Task for BrokenNetwork {
    const NAME: &'static str = "BrokenNetwork";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(BrokenNetwork)
    }

    async fn init(&self) -> InitResult {
        Err(anyhow::anyhow!("no route to host").into())
    }
}

struct Healthy;

impl Task for Healthy {
    const NAME: &'static str = "Healthy";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Healthy)
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        HEALTHY_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_init_failures_are_aggregated() {
    let log = EventLog::default();
    let definition = log
        .attach(
            ServiceBuilder::new("lifecycle")
                .with_task::<BrokenDisk>()
                .with_task::<Healthy>()
                .with_task::<BrokenNetwork>(),
        )
        .build();

    let err = definition
        .start_background(definition.options().unwrap())
        .await
        .err()
        .expect("service should fail to start");
    match err {
        ServiceError::InitFailed { count, errors } => {
            assert_eq!(count, 2);
            let failed: Vec<_> = errors.iter().map(|(task, _)| task.as_str()).collect();
            assert_eq!(failed, ["BrokenDisk", "BrokenNetwork"]);
            assert_eq!(errors[0].1.to_string(), "disk full");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(HEALTHY_RUNS.load(Ordering::SeqCst), 0);
    assert_eq!(
        log.filtered(&[
            TaskState::Active,
            TaskState::Failed,
            TaskState::Stopping,
            TaskState::Stopped,
        ]),
        [
            ("BrokenDisk", TaskState::Failed),
            ("Healthy", TaskState::Active),
            ("BrokenNetwork", TaskState::Failed),
            ("Healthy", TaskState::Stopping),
            ("Healthy", TaskState::Stopped),
        ]
    );
}

struct Database {
    ctx: TaskContext,
}

impl Task for Database {
    const NAME: &'static str = "Database";

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Self { ctx })
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        self.ctx.stopped().await;
        Ok(())
    }
}

struct Api {
    ctx: TaskContext,
    database_seen: Mutex<bool>,
}

impl Task for Api {
    const NAME: &'static str = "Api";

    fn deps() -> Vec<TaskDescriptor> {
        vec![TaskDescriptor::of::<Database>()]
    }

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Self {
            ctx,
            database_seen: Mutex::new(false),
        })
    }

    async fn init(&self) -> InitResult {
        let database = self.ctx.service().require::<Database>()?;
        *self.database_seen.lock().unwrap() = database.ctx.name() == "Database";
        Ok(())
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        self.ctx.stopped().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_start_and_stop_follow_dependency_order() {
    let log = EventLog::default();
    let definition = log
        .attach(ServiceBuilder::new("lifecycle").with_task::<Api>())
        .build();

    let runner = start(&definition).await;
    let api = runner.service().require::<Api>().unwrap();
    assert!(*api.database_seen.lock().unwrap());
    assert_eq!(api.ctx.logger(), "lifecycle.Api");
    stop(runner).await;

    assert_eq!(
        log.filtered(&[TaskState::Initializing, TaskState::Active, TaskState::Running]),
        [
            ("Database", TaskState::Initializing),
            ("Database", TaskState::Active),
            ("Api", TaskState::Initializing),
            ("Api", TaskState::Active),
            ("Database", TaskState::Running),
            ("Api", TaskState::Running),
        ]
    );
    assert_eq!(
        log.filtered(&[TaskState::Stopping, TaskState::Stopped]),
        [
            ("Api", TaskState::Stopping),
            ("Database", TaskState::Stopping),
            ("Api", TaskState::Stopped),
            ("Database", TaskState::Stopped),
        ]
    );
}

struct Faulty;

impl Task for Faulty {
    const NAME: &'static str = "Faulty";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Faulty)
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        tokio::time::sleep(Duration::from_millis(20)).await;
        anyhow::bail!("lost connection")
    }
}

struct Panicky;

impl Task for Panicky {
    const NAME: &'static str = "Panicky";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Panicky)
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        tokio::time::sleep(Duration::from_millis(20)).await;
        panic!("invariant violated");
    }
}

#[tokio::test]
async fn test_worker_error_shuts_service_down() {
    let definition = ServiceBuilder::new("lifecycle")
        .with_task::<Idle>()
        .with_task::<Faulty>()
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    tokio::time::timeout(Duration::from_secs(10), runner.wait())
        .await
        .expect("service did not shut down")
        .unwrap();

    assert_eq!(service.status(), ServiceStatus::Stopped);
    assert_eq!(service.task_state("Idle"), Some(TaskState::Stopped));
}

#[tokio::test]
async fn test_worker_panic_shuts_service_down() {
    let definition = ServiceBuilder::new("lifecycle")
        .with_task::<Idle>()
        .with_task::<Panicky>()
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    tokio::time::timeout(Duration::from_secs(10), runner.wait())
        .await
        .expect("service did not shut down")
        .unwrap();

    assert_eq!(service.status(), ServiceStatus::Stopped);
    assert_eq!(service.task_state("Panicky"), Some(TaskState::Stopped));
}

struct Shutter {
    ctx: TaskContext,
}

impl Task for Shutter {
    const NAME: &'static str = "Shutter";

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Self { ctx })
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.ctx.service().shutdown();
        Ok(())
    }
}

#[tokio::test]
async fn test_run_returns_after_shutdown_from_a_task() {
    let definition = ServiceBuilder::new("lifecycle")
        .with_task::<Idle>()
        .with_task::<Shutter>()
        .build();
    let options = definition.options().unwrap();

    tokio::time::timeout(Duration::from_secs(10), definition.run(options))
        .await
        .expect("service did not shut down")
        .unwrap();
}

static RESTARTABLE_CREATED: AtomicUsize = AtomicUsize::new(0);

struct Restartable {
    ctx: TaskContext,
}

impl Task for Restartable {
    const NAME: &'static str = "Restartable";

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        RESTARTABLE_CREATED.fetch_add(1, Ordering::SeqCst);
        Ok(Self { ctx })
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        self.ctx.stopped().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_restart_creates_tasks_again() {
    let definition = ServiceBuilder::new("lifecycle")
        .with_task::<Restartable>()
        .build();

    let runner = start(&definition).await;
    let first = runner.service();
    assert_eq!(RESTARTABLE_CREATED.load(Ordering::SeqCst), 1);

    runner.restart();
    eventually(|| {
        RESTARTABLE_CREATED.load(Ordering::SeqCst) == 2
            && runner.service().status() == ServiceStatus::Alive
    })
    .await;

    assert!(first.restart_requested());
    assert_eq!(first.status(), ServiceStatus::Stopped);
    let second = runner.service();
    assert!(!second.restart_requested());
    assert_eq!(second.task_state("Restartable"), Some(TaskState::Running));

    stop(runner).await;
    assert_eq!(RESTARTABLE_CREATED.load(Ordering::SeqCst), 2);
}

static SLOW_RESTART_CREATED: AtomicUsize = AtomicUsize::new(0);

struct SlowRestart {
    ctx: TaskContext,
    generation: usize,
}

impl Task for SlowRestart {
    const NAME: &'static str = "SlowRestart";

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        let generation = SLOW_RESTART_CREATED.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self { ctx, generation })
    }

    async fn init(&self) -> InitResult {
        if self.generation > 1 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(())
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        self.ctx.stopped().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_while_restarting_stops_the_new_service() {
    let definition = ServiceBuilder::new("lifecycle")
        .with_task::<SlowRestart>()
        .build();

    let runner = start(&definition).await;
    runner.restart();
    eventually(|| SLOW_RESTART_CREATED.load(Ordering::SeqCst) == 2).await;
    runner.shutdown();

    tokio::time::timeout(Duration::from_secs(5), runner.wait())
        .await
        .expect("service did not stop after a shutdown during restart")
        .unwrap();
    assert_eq!(SLOW_RESTART_CREATED.load(Ordering::SeqCst), 2);
}

struct Registry;

impl Task for Registry {
    const NAME: &'static str = "Registry";
    const LOOPLESS: bool = true;

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Registry)
    }
}

#[tokio::test]
async fn test_loopless_task_has_no_workers() {
    let log = EventLog::default();
    let definition = log
        .attach(ServiceBuilder::new("lifecycle").with_task::<Registry>())
        .build();

    let runner = start(&definition).await;
    let service = runner.service();
    let handle = service.require_task("Registry").unwrap();
    assert!(handle.workers().is_empty());
    assert!(handle.descriptor().is_loopless());
    assert_eq!(service.status(), ServiceStatus::Alive);

    stop(runner).await;
    assert_eq!(service.task_state("Registry"), Some(TaskState::Stopped));
    assert_eq!(
        log.filtered(&[TaskState::Running, TaskState::Stopped]),
        [
            ("Registry", TaskState::Running),
            ("Registry", TaskState::Stopped),
        ]
    );
}

struct Quitter;

impl Task for Quitter {
    const NAME: &'static str = "Quitter";

    fn create(_ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Quitter)
    }
}

#[tokio::test]
async fn test_status_follows_the_service() {
    let definition = ServiceBuilder::new("lifecycle")
        .with_task::<Idle>()
        .with_task::<Quitter>()
        .build();

    let created = definition
        .create(definition.options().unwrap())
        .await
        .unwrap();
    assert_eq!(created.status(), ServiceStatus::Starting);
    assert!(created.alive_since().is_none());
    assert_eq!(created.task_state("Quitter"), Some(TaskState::Active));
    drop(created);

    let runner = start(&definition).await;
    let service = runner.service();
    assert!(service.alive_since().is_some());

    eventually(|| service.status() == ServiceStatus::Warning).await;
    assert_eq!(service.status_details(), "Quitter has dead workers!");

    stop(runner).await;
    assert_eq!(service.status(), ServiceStatus::Stopped);
    assert_eq!(service.status_details(), "lifecycle is stopped");
}

#[tokio::test]
async fn test_idle_service_is_alive() {
    let definition = ServiceBuilder::new("lifecycle").with_task::<Idle>().build();

    let runner = start(&definition).await;
    let service = runner.service();
    assert_eq!(service.status(), ServiceStatus::Alive);
    assert_eq!(service.status_details(), "");

    service.shutdown();
    assert!(service.is_stopping());
    runner.wait().await.unwrap();
    assert_eq!(service.status(), ServiceStatus::Stopped);
}

struct Crew {
    ctx: TaskContext,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Task for Crew {
    const NAME: &'static str = "Crew";
    const WORKERS: usize = 2;

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Self {
            ctx,
            seen: Arc::default(),
        })
    }

    async fn run(&self, worker: &Worker) -> TaskResult {
        self.seen.lock().unwrap().push(worker.name().to_string());
        self.ctx.stopped().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_workers_are_numbered() {
    let definition = ServiceBuilder::new("lifecycle").with_task::<Crew>().build();

    let runner = start(&definition).await;
    let crew = runner.service().require::<Crew>().unwrap();
    eventually(|| crew.seen.lock().unwrap().len() == 2).await;

    let mut seen = crew.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, ["Crew-1", "Crew-2"]);

    let handle = runner.service().require_task("Crew").unwrap();
    let indexes: Vec<_> = handle.workers().iter().map(|w| w.index()).collect();
    assert_eq!(indexes, [1, 2]);

    stop(runner).await;
}
