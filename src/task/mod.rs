pub(crate) mod collection;
pub(crate) mod context;
pub(crate) mod descriptor;
pub(crate) mod handle;

use std::{any::Any, fmt, future::Future, sync::Arc, time::Duration};

use crate::{
    error::{ConfigError, OptionError, ServiceError},
    options::OptionSpec,
};

pub use collection::{resolve_dependencies, TaskCollection, TaskRegistry};
pub use context::TaskContext;
pub use descriptor::TaskDescriptor;
pub use handle::{LifecycleEvent, LifecycleListener, TaskHandle};

/// Error type returned by user code running inside a task.
pub type TaskError = anyhow::Error;

pub type TaskResult = Result<(), TaskError>;

/// Outcome of [`Task::init`] other than success.
#[derive(Debug)]
pub enum InitError {
    /// The task declines to run. It is dropped from the service without
    /// failing startup.
    Skip(String),
    /// Startup of the whole service fails.
    Failed(TaskError),
}

impl InitError {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(err) => write!(f, "{err:#}"),
        }
    }
}

impl From<anyhow::Error> for InitError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

impl From<OptionError> for InitError {
    fn from(err: OptionError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<ConfigError> for InitError {
    fn from(err: ConfigError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<ServiceError> for InitError {
    fn from(err: ServiceError) -> Self {
        Self::Failed(err.into())
    }
}

pub type InitResult = Result<(), InitError>;

/// Outcome of one engine execution other than success.
#[derive(Debug)]
pub enum ExecuteError {
    /// Not now: retry, after `delay` if one is given.
    TryLater(Option<Duration>),
    /// The execution failed for good.
    Failed(TaskError),
}

impl ExecuteError {
    pub fn try_later() -> Self {
        Self::TryLater(None)
    }

    pub fn try_later_after(delay: Duration) -> Self {
        Self::TryLater(Some(delay))
    }
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TryLater(None) => write!(f, "try later"),
            Self::TryLater(Some(delay)) => write!(f, "try later in {delay:?}"),
            Self::Failed(err) => write!(f, "{err:#}"),
        }
    }
}

impl From<anyhow::Error> for ExecuteError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

impl From<OptionError> for ExecuteError {
    fn from(err: OptionError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<ServiceError> for ExecuteError {
    fn from(err: ServiceError) -> Self {
        Self::Failed(err.into())
    }
}

/// One worker of a task: a Tokio task running [`Task::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    index: usize,
    name: String,
}

impl Worker {
    pub(crate) fn new(task: &str, index: usize, total: usize) -> Self {
        let name = if total > 1 {
            format!("{task}-{index}")
        } else {
            task.to_string()
        };
        Self { index, name }
    }

    /// 1-based position among the task's workers.
    pub fn index(&self) -> usize {
        self.index
    }

    /// `<task>` for a single worker, `<task>-<n>` otherwise.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The trait users implement for units managed by a service.
///
/// A task is described by its type: the associated constants and the
/// `deps`/`options` functions are read before any instance exists, which is
/// how the service resolves dependencies and registers options. An instance
/// is then built with [`Task::create`] each time the service starts.
///
/// # Lifecycle
///
/// `create` → `init` (in dependency order) → `run` on each worker →
/// `stop` (reverse order) → workers joined (reverse order).
///
/// # Example
///
/// ```rust
/// use taskhost::{Task, TaskContext, TaskDescriptor, TaskResult, Worker};
///
/// struct Ticker {
///     ctx: TaskContext,
/// }
///
/// impl Task for Ticker {
///     const NAME: &'static str = "Ticker";
///
///     fn create(ctx: TaskContext) -> anyhow::Result<Self> {
///         Ok(Self { ctx })
///     }
///
///     async fn run(&self, _worker: &Worker) -> TaskResult {
///         while !self.ctx.sleep(std::time::Duration::from_secs(1)).await {
///             tracing::info!("tick");
///         }
///         Ok(())
///     }
/// }
///
/// let descriptor = TaskDescriptor::of::<Ticker>();
/// assert_eq!(descriptor.name(), "Ticker");
/// ```
pub trait Task: Send + Sync + Sized + 'static {
    /// Unique name, also the default option prefix.
    const NAME: &'static str;

    /// Overrides the option prefix, which otherwise is [`Task::NAME`].
    const OPT_PREFIX: Option<&'static str> = None;

    /// Loopless tasks are initialized and stopped but get no workers.
    const LOOPLESS: bool = false;

    /// Default number of workers.
    const WORKERS: usize = 1;

    /// Tasks that must be created and initialized before this one.
    fn deps() -> Vec<TaskDescriptor> {
        Vec::new()
    }

    /// Options owned by this task, stored under `<prefix>_<name>`.
    fn options() -> Vec<OptionSpec> {
        Vec::new()
    }

    fn create(ctx: TaskContext) -> Result<Self, TaskError>;

    /// Runs once dependencies are initialized. Return [`InitError::Skip`]
    /// to leave the service without this task.
    fn init(&self) -> impl Future<Output = InitResult> + Send {
        async { Ok(()) }
    }

    /// Worker count actually spawned; may depend on options.
    fn workers(&self) -> usize {
        Self::WORKERS
    }

    /// Body of each worker. Returning an error shuts the whole service down.
    fn run(&self, worker: &Worker) -> impl Future<Output = TaskResult> + Send {
        let _ = worker;
        async { Ok(()) }
    }

    /// Called once the task has been asked to stop, after its stop token
    /// was cancelled. Wake up anything the workers may be blocked on.
    fn stop(&self) {}
}

/// Dyn-compatible wrapper for `Task`. Not user-facing.
#[async_trait::async_trait]
pub(crate) trait DynTask: Send + Sync + 'static {
    async fn init_boxed(&self) -> InitResult;
    async fn run_boxed(&self, worker: &Worker) -> TaskResult;
    fn stop(&self);
    fn workers(&self) -> usize;
}

#[async_trait::async_trait]
impl<T: Task> DynTask for T {
    async fn init_boxed(&self) -> InitResult {
        Task::init(self).await
    }

    async fn run_boxed(&self, worker: &Worker) -> TaskResult {
        Task::run(self, worker).await
    }

    fn stop(&self) {
        Task::stop(self)
    }

    fn workers(&self) -> usize {
        Task::workers(self).max(1)
    }
}

/// A freshly created instance, both as a dyn task and as `Any` for typed
/// lookups.
pub(crate) struct CreatedTask {
    pub(crate) task: Arc<dyn DynTask>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Uninitialized,
    Initializing,
    Skipped,
    Failed,
    /// Initialized, workers not started yet.
    Active,
    Running,
    Stopping,
    Stopped,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskState::Stopped)
    }

    /// True once `init` succeeded and the task has not been stopped.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Active | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::Active => write!(f, "active"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
