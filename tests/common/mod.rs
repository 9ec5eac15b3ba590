use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskhost::{
    run_until_true, LifecycleEvent, ServiceBuilder, ServiceDefinition, ServiceRunner, Task,
    TaskContext, TaskResult, TaskState, Worker,
};

// Logs go to the test output when RUST_LOG is set.
#[allow(unused)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Records every task state change seen by a service.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

#[allow(unused)]
impl EventLog {
    pub fn attach(&self, builder: ServiceBuilder) -> ServiceBuilder {
        let events = self.events.clone();
        builder.with_lifecycle_listener(move |event| events.lock().unwrap().push(event.clone()))
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    // (task, state) pairs for the given states, in the order they happened.
    pub fn filtered(&self, states: &[TaskState]) -> Vec<(&'static str, TaskState)> {
        self.events()
            .into_iter()
            .filter(|e| states.contains(&e.state))
            .map(|e| (e.task, e.state))
            .collect()
    }
}

// Starts `definition` in the background with its default options.
#[allow(unused)]
pub async fn start(definition: &ServiceDefinition) -> ServiceRunner {
    init_tracing();
    let options = definition.options().unwrap();
    definition.start_background(options).await.unwrap()
}

// Shuts the service down and waits for it.
#[allow(unused)]
pub async fn stop(runner: ServiceRunner) {
    runner.shutdown();
    tokio::time::timeout(Duration::from_secs(30), runner.wait())
        .await
        .expect("service did not stop in time")
        .unwrap();
}

#[allow(unused)]
pub async fn eventually<F: FnMut() -> bool>(check: F) {
    run_until_true(check, Duration::from_secs(10))
        .await
        .expect("condition not met in time");
}

// A task whose workers idle until asked to stop.
#[allow(unused)]
pub struct Idle {
    ctx: TaskContext,
}

impl Task for Idle {
    const NAME: &'static str = "Idle";

    fn create(ctx: TaskContext) -> anyhow::Result<Self> {
        Ok(Self { ctx })
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        self.ctx.stopped().await;
        Ok(())
    }
}
