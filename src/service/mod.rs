pub(crate) mod builder;
pub(crate) mod runner;
mod signals;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::SystemTime,
};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::{
    counters::CounterSet,
    error::{OptionError, ServiceError},
    options::{OptionValue, Options},
    task::{
        InitError, LifecycleListener, Task, TaskCollection, TaskContext, TaskHandle, TaskState,
    },
};

use builder::{ServiceDefinition, TASKS_OPTION};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Health of a running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Tasks are being created or initialized.
    Starting,
    Alive,
    /// A worker exited while its task was supposed to be running.
    Warning,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Alive => write!(f, "alive"),
            Self::Warning => write!(f, "warning"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct Warnings {
    next_id: u64,
    messages: BTreeMap<u64, String>,
}

struct Shared {
    name: String,
    version: String,
    options: Options,
    stop: CancellationToken,
    restart: AtomicBool,
    phase: Mutex<Phase>,
    alive_since: Mutex<Option<SystemTime>>,
    tasks: RwLock<TaskCollection>,
    warnings: Mutex<Warnings>,
    exported: Mutex<BTreeMap<String, String>>,
    counters: CounterSet,
    listener: Option<LifecycleListener>,
    span: Span,
}

/// One incarnation of a service: its task instances plus the supervisory
/// state they share.
///
/// A restart throws the whole `Service` away and creates a new one from the
/// same [`ServiceDefinition`] and [`Options`]. Cloning is cheap.
#[derive(Clone)]
pub struct Service {
    shared: Arc<Shared>,
}

/// Non-owning reference to a [`Service`], held by its tasks.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Weak<Shared>,
}

impl Service {
    /// Creates every selected task and its dependencies, then initializes
    /// them in dependency order.
    ///
    /// Every task gets to attempt `init`. If any of them failed, the tasks
    /// that did initialize are stopped again and the failures are returned
    /// together.
    pub(crate) async fn create(
        definition: &ServiceDefinition,
        options: Options,
    ) -> Result<Self, ServiceError> {
        let span = tracing::info_span!("service", service = %definition.name());
        let service = Self {
            shared: Arc::new(Shared {
                name: definition.name().to_string(),
                version: definition.version().to_string(),
                options,
                stop: CancellationToken::new(),
                restart: AtomicBool::new(false),
                phase: Mutex::new(Phase::Starting),
                alive_since: Mutex::new(None),
                tasks: RwLock::new(TaskCollection::new()),
                warnings: Mutex::new(Warnings::default()),
                exported: Mutex::new(BTreeMap::new()),
                counters: CounterSet::new(),
                listener: definition.listener(),
                span: span.clone(),
            }),
        };
        async {
            service.create_tasks(definition)?;
            service.init_tasks().await
        }
        .instrument(span)
        .await?;
        Ok(service)
    }

    fn create_tasks(&self, definition: &ServiceDefinition) -> Result<(), ServiceError> {
        let mut tasks = TaskCollection::new();
        tasks.register_all(definition.registry().descriptors());
        tasks.register_all(definition.tasks().iter().cloned());

        let selected = match self.shared.options.get(TASKS_OPTION) {
            Ok(Some(OptionValue::List(names))) => Some(names),
            Ok(_) | Err(OptionError::Unknown(_)) => definition.selected_tasks(),
            Err(err) => return Err(err.into()),
        };
        if let Some(names) = selected {
            tasks.select(&names)?;
        }

        let order = tasks.resolve()?;
        tracing::info!(
            tasks = ?order.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "Creating tasks"
        );
        let mut handles = Vec::with_capacity(order.len());
        for descriptor in order {
            let ctx = TaskContext::new(
                &descriptor,
                &self.shared.name,
                self.handle(),
                self.shared.options.clone(),
                self.shared.stop.clone(),
            );
            let created =
                descriptor
                    .create(ctx.clone())
                    .map_err(|error| ServiceError::CreateFailed {
                        task: descriptor.name().to_string(),
                        error,
                    })?;
            handles.push(Arc::new(TaskHandle::new(
                descriptor,
                created,
                ctx,
                self.shared.listener.clone(),
            )));
        }
        tasks.install(handles);
        *self.tasks_mut() = tasks;
        Ok(())
    }

    async fn init_tasks(&self) -> Result<(), ServiceError> {
        let handles = self.task_handles();
        let mut errors = Vec::new();
        for handle in &handles {
            match handle.init().await {
                Ok(()) => {}
                Err(InitError::Skip(_)) => self.tasks_mut().remove(handle.name()),
                Err(InitError::Failed(err)) => errors.push((handle.name().to_string(), err)),
            }
        }
        if errors.is_empty() {
            return Ok(());
        }

        tracing::error!(count = errors.len(), "Unable to initialize tasks");
        for (task, err) in &errors {
            tracing::error!(task = %task, error = %format!("{err:#}"), "Task failed to initialize");
        }
        // No workers were spawned, so joining only completes the lifecycle.
        for handle in handles.iter().rev() {
            handle.stop();
        }
        for handle in handles.iter().rev() {
            handle.join().await;
        }
        *lock(&self.shared.phase) = Phase::Stopped;
        Err(ServiceError::InitFailed {
            count: errors.len(),
            errors,
        })
    }

    /// Starts every task's workers in dependency order.
    pub(crate) fn start(&self) {
        let _entered = self.shared.span.enter();
        for handle in self.task_handles() {
            handle.start();
        }
        *lock(&self.shared.phase) = Phase::Running;
        *lock(&self.shared.alive_since) = Some(SystemTime::now());
        tracing::info!("All tasks started");
    }

    /// Waits for a stop request, then stops and joins every task in reverse
    /// dependency order.
    pub(crate) async fn wait(&self, handle_signals: bool) {
        async {
            if handle_signals {
                tokio::select! {
                    _ = self.shared.stop.cancelled() => {}
                    signal = signals::shutdown_signal() => {
                        tracing::info!(%signal, "Received signal, shutting down");
                        self.shutdown();
                    }
                }
            } else {
                self.shared.stop.cancelled().await;
            }
            self.stop_tasks().await;
        }
        .instrument(self.shared.span.clone())
        .await
    }

    async fn stop_tasks(&self) {
        let handles = self.task_handles();
        tracing::info!("Stopping tasks");
        for handle in handles.iter().rev() {
            handle.stop();
        }
        tracing::info!("Waiting for tasks to shut down");
        for handle in handles.iter().rev() {
            handle.join().await;
        }
        *lock(&self.shared.phase) = Phase::Stopped;
        tracing::info!("All tasks stopped");
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn version(&self) -> &str {
        &self.shared.version
    }

    /// Requests a graceful stop. Does not wait for it.
    pub fn shutdown(&self) {
        if !self.shared.stop.is_cancelled() {
            tracing::info!(parent: &self.shared.span, "Shutdown requested");
        }
        self.shared.stop.cancel();
    }

    /// Requests a stop after which the service is created again.
    pub fn restart(&self) {
        self.shared.restart.store(true, Ordering::SeqCst);
        self.shutdown();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    pub fn restart_requested(&self) -> bool {
        self.shared.restart.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn stopping(&self) {
        self.shared.stop.cancelled().await
    }

    fn tasks(&self) -> RwLockReadGuard<'_, TaskCollection> {
        self.shared
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_mut(&self) -> RwLockWriteGuard<'_, TaskCollection> {
        self.shared
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Task instances in dependency order, skipped tasks excluded.
    pub fn task_handles(&self) -> Vec<Arc<TaskHandle>> {
        self.tasks().handles()
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.task_handles().iter().map(|h| h.name()).collect()
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks().get(name).map(|h| h.state())
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<TaskHandle>> {
        self.tasks().get(name)
    }

    pub fn require_task(&self, name: &str) -> Result<Arc<TaskHandle>, ServiceError> {
        self.tasks().require(name)
    }

    pub fn get<T: Task>(&self) -> Option<Arc<T>> {
        self.tasks().get_typed::<T>()
    }

    pub fn require<T: Task>(&self) -> Result<Arc<T>, ServiceError> {
        self.tasks().require_typed::<T>()
    }

    /// Records a health warning and returns its id.
    pub fn register_warning(&self, message: impl Into<String>) -> u64 {
        let mut warnings = lock(&self.shared.warnings);
        let id = warnings.next_id;
        warnings.next_id += 1;
        warnings.messages.insert(id, message.into());
        id
    }

    /// Returns false if no warning has this id.
    pub fn clear_warning(&self, id: u64) -> bool {
        lock(&self.shared.warnings).messages.remove(&id).is_some()
    }

    pub fn clear_warnings(&self) {
        lock(&self.shared.warnings).messages.clear();
    }

    pub fn warnings(&self) -> BTreeMap<u64, String> {
        lock(&self.shared.warnings).messages.clone()
    }

    /// The exported value of `key`, empty if it was never set.
    pub fn exported_value(&self, key: &str) -> String {
        lock(&self.shared.exported)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Sets `key`, or removes it when `value` is `None`.
    pub fn set_exported_value(&self, key: impl Into<String>, value: Option<impl Into<String>>) {
        let mut exported = lock(&self.shared.exported);
        match value {
            Some(value) => {
                exported.insert(key.into(), value.into());
            }
            None => {
                exported.remove(&key.into());
            }
        }
    }

    pub fn exported_values(&self) -> BTreeMap<String, String> {
        lock(&self.shared.exported).clone()
    }

    /// Exported values whose key matches `pattern` from its first character.
    pub fn exported_values_matching(
        &self,
        pattern: &str,
    ) -> Result<BTreeMap<String, String>, regex::Error> {
        let re = Regex::new(&format!("^(?:{pattern})"))?;
        Ok(lock(&self.shared.exported)
            .iter()
            .filter(|(k, _)| re.is_match(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// The exported values of `keys`, empty strings for unset ones.
    pub fn selected_exported_values<S: AsRef<str>>(&self, keys: &[S]) -> BTreeMap<String, String> {
        let exported = lock(&self.shared.exported);
        keys.iter()
            .map(|k| {
                let k = k.as_ref();
                (k.to_string(), exported.get(k).cloned().unwrap_or_default())
            })
            .collect()
    }

    /// Service-level counters. Task counters live on each task's context.
    pub fn counters(&self) -> &CounterSet {
        &self.shared.counters
    }

    /// Every counter of the service and its tasks, task counters prefixed
    /// with `<task>.`.
    pub fn all_counters(&self) -> BTreeMap<String, Option<f64>> {
        let mut out = self.shared.counters.snapshot();
        for handle in self.task_handles() {
            for (key, value) in handle.counters().snapshot() {
                out.insert(format!("{}.{key}", handle.name()), value);
            }
        }
        out
    }

    pub fn counter(&self, name: &str) -> Option<f64> {
        self.all_counters().get(name).copied().flatten()
    }

    pub fn status(&self) -> ServiceStatus {
        match *lock(&self.shared.phase) {
            Phase::Stopped => ServiceStatus::Stopped,
            _ if self.is_stopping() => ServiceStatus::Stopping,
            Phase::Starting => ServiceStatus::Starting,
            Phase::Running => {
                if self.task_handles().iter().any(|h| h.has_dead_workers()) {
                    ServiceStatus::Warning
                } else {
                    ServiceStatus::Alive
                }
            }
        }
    }

    /// Human-readable explanation of [`Service::status`]; empty when alive.
    pub fn status_details(&self) -> String {
        match self.status() {
            ServiceStatus::Stopping => format!("{} is shutting down", self.name()),
            ServiceStatus::Stopped => format!("{} is stopped", self.name()),
            ServiceStatus::Starting => format!("{} is starting", self.name()),
            ServiceStatus::Warning => self
                .task_handles()
                .iter()
                .find(|h| h.has_dead_workers())
                .map(|h| format!("{} has dead workers!", h.name()))
                .unwrap_or_default(),
            ServiceStatus::Alive => String::new(),
        }
    }

    /// When the tasks were started; `None` before that.
    pub fn alive_since(&self) -> Option<SystemTime> {
        *lock(&self.shared.alive_since)
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn get_option(&self, key: &str) -> Result<Option<OptionValue>, OptionError> {
        self.shared.options.get(key)
    }

    pub fn set_option(&self, key: &str, value: impl Into<OptionValue>) -> Result<(), OptionError> {
        self.shared.options.set(key, value)
    }

    pub fn get_options(&self) -> BTreeMap<String, Option<OptionValue>> {
        self.shared.options.snapshot()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .field("tasks", &self.task_names())
            .finish()
    }
}

impl ServiceHandle {
    pub fn upgrade(&self) -> Option<Service> {
        self.shared.upgrade().map(|shared| Service { shared })
    }

    fn service(&self) -> Result<Service, ServiceError> {
        self.upgrade().ok_or(ServiceError::Gone)
    }

    /// Requests a graceful stop of the whole service.
    pub fn shutdown(&self) {
        if let Some(service) = self.upgrade() {
            service.shutdown();
        }
    }

    pub fn restart(&self) {
        if let Some(service) = self.upgrade() {
            service.restart();
        }
    }

    /// True once the service is stopping or gone.
    pub fn is_stopping(&self) -> bool {
        self.upgrade().map_or(true, |s| s.is_stopping())
    }

    /// Looks up a sibling task by type.
    pub fn require<T: Task>(&self) -> Result<Arc<T>, ServiceError> {
        self.service()?.require::<T>()
    }

    pub fn get<T: Task>(&self) -> Option<Arc<T>> {
        self.upgrade()?.get::<T>()
    }

    pub fn require_task(&self, name: &str) -> Result<Arc<TaskHandle>, ServiceError> {
        self.service()?.require_task(name)
    }

    pub fn register_warning(&self, message: impl Into<String>) -> Result<u64, ServiceError> {
        Ok(self.service()?.register_warning(message))
    }

    pub fn set_exported_value(
        &self,
        key: impl Into<String>,
        value: Option<impl Into<String>>,
    ) -> Result<(), ServiceError> {
        self.service()?.set_exported_value(key, value);
        Ok(())
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(service) => f.debug_tuple("ServiceHandle").field(&service.name()).finish(),
            None => f.write_str("ServiceHandle(<gone>)"),
        }
    }
}
