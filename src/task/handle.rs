use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    counters::CounterSet,
    task::{
        CreatedTask, DynTask, InitError, InitResult, Task, TaskContext, TaskDescriptor, TaskState,
        Worker,
    },
};

/// How often `join` reports that it is still waiting for a worker.
const JOIN_POLL: Duration = Duration::from_millis(500);

/// A task changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub task: &'static str,
    pub state: TaskState,
}

/// Observer of every task state change of a service.
pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A created task instance and its workers.
pub struct TaskHandle {
    descriptor: TaskDescriptor,
    task: Arc<dyn DynTask>,
    any: Arc<dyn Any + Send + Sync>,
    ctx: TaskContext,
    state: Mutex<TaskState>,
    workers: Mutex<Vec<Worker>>,
    join_handles: Mutex<Vec<(Worker, JoinHandle<()>)>>,
    listener: Option<LifecycleListener>,
}

impl TaskHandle {
    pub(crate) fn new(
        descriptor: TaskDescriptor,
        created: CreatedTask,
        ctx: TaskContext,
        listener: Option<LifecycleListener>,
    ) -> Self {
        Self {
            descriptor,
            task: created.task,
            any: created.any,
            ctx,
            state: Mutex::new(TaskState::Uninitialized),
            workers: Mutex::new(Vec::new()),
            join_handles: Mutex::new(Vec::new()),
            listener,
        }
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    pub fn counters(&self) -> &CounterSet {
        self.ctx.counters()
    }

    /// The instance as its concrete type.
    pub fn downcast<T: Task>(&self) -> Option<Arc<T>> {
        self.any.clone().downcast::<T>().ok()
    }

    /// Workers prepared by `init`, or spawned by `start`.
    pub fn workers(&self) -> Vec<Worker> {
        let prepared = lock(&self.workers).clone();
        if !prepared.is_empty() {
            return prepared;
        }
        lock(&self.join_handles)
            .iter()
            .map(|(worker, _)| worker.clone())
            .collect()
    }

    /// True if a worker has exited while the task was meant to be running.
    pub fn has_dead_workers(&self) -> bool {
        self.state().is_running()
            && lock(&self.join_handles)
                .iter()
                .any(|(_, handle)| handle.is_finished())
    }

    fn mark(&self, state: TaskState) {
        *lock(&self.state) = state;
        tracing::debug!(parent: self.ctx.span(), task = self.name(), %state, "Task state changed");
        if let Some(listener) = &self.listener {
            listener(&LifecycleEvent {
                task: self.name(),
                state,
            });
        }
    }

    /// Runs the task's `init` and prepares its workers on success.
    pub(crate) async fn init(&self) -> InitResult {
        self.mark(TaskState::Initializing);
        let result = self
            .task
            .init_boxed()
            .instrument(self.ctx.span().clone())
            .await;
        match &result {
            Ok(()) => {
                if !self.descriptor.is_loopless() {
                    let total = self.task.workers();
                    *lock(&self.workers) = (1..=total)
                        .map(|index| Worker::new(self.name(), index, total))
                        .collect();
                }
                self.mark(TaskState::Active);
            }
            Err(InitError::Skip(reason)) => {
                tracing::info!(parent: self.ctx.span(), task = self.name(), %reason, "Skipping task");
                self.mark(TaskState::Skipped);
            }
            Err(InitError::Failed(err)) => {
                tracing::error!(parent: self.ctx.span(), task = self.name(), error = %format!("{err:#}"), "Task failed to initialize");
                self.mark(TaskState::Failed);
            }
        }
        result
    }

    /// Spawns one Tokio task per prepared worker.
    ///
    /// A worker that returns an error or panics shuts the service down.
    pub(crate) fn start(&self) {
        if self.state() != TaskState::Active {
            return;
        }
        let workers = std::mem::take(&mut *lock(&self.workers));
        let mut join_handles = lock(&self.join_handles);
        for worker in workers {
            let task = self.task.clone();
            let service = self.ctx.service().clone();
            let span = tracing::info_span!(parent: self.ctx.span(), "worker", worker = %worker.name());
            let spawned = worker.clone();
            let handle = tokio::spawn(
                async move {
                    let outcome = AssertUnwindSafe(task.run_boxed(&spawned))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => tracing::debug!("Worker exited"),
                        Ok(Err(err)) => {
                            tracing::error!(error = %format!("{err:#}"), "Unhandled error in worker, shutting down");
                            service.shutdown();
                        }
                        Err(panic) => {
                            tracing::error!(panic = %panic_message(&*panic), "Worker panicked, shutting down");
                            service.shutdown();
                        }
                    }
                }
                .instrument(span),
            );
            join_handles.push((worker, handle));
        }
        drop(join_handles);
        self.mark(TaskState::Running);
    }

    /// Asks the task to stop. Calling it again has no effect.
    pub(crate) fn stop(&self) {
        if !self.state().is_active() {
            return;
        }
        self.mark(TaskState::Stopping);
        self.ctx.cancel();
        self.task.stop();
    }

    /// Waits for every worker to exit.
    pub(crate) async fn join(&self) {
        let join_handles = std::mem::take(&mut *lock(&self.join_handles));
        for (worker, mut handle) in join_handles {
            while tokio::time::timeout(JOIN_POLL, &mut handle).await.is_err() {
                tracing::debug!(parent: self.ctx.span(), worker = %worker.name(), "Still waiting for worker to exit");
            }
        }
        if self.state() == TaskState::Stopping {
            self.mark(TaskState::Stopped);
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
