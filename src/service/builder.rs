use std::sync::Arc;

use crate::{
    error::{ConfigError, ServiceError},
    options::{OptionSpec, Options},
    service::{runner::ServiceRunner, Service},
    task::{
        resolve_dependencies, LifecycleEvent, LifecycleListener, Task, TaskDescriptor,
        TaskRegistry,
    },
};

/// Key of the built-in option selecting which tasks run.
pub(crate) const TASKS_OPTION: &str = "tasks";

/// Builds a [`ServiceDefinition`]: the tasks a service runs and how.
pub struct ServiceBuilder {
    name: String,
    version: String,
    tasks: Vec<TaskDescriptor>,
    registry: TaskRegistry,
    options: Vec<OptionSpec>,
    selected: Option<Vec<String>>,
    listener: Option<LifecycleListener>,
    handle_signals: bool,
}

impl ServiceBuilder {
    /// Creates a builder for a service called `name` with no tasks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            tasks: Vec::new(),
            registry: TaskRegistry::new(),
            options: Vec::new(),
            selected: None,
            listener: None,
            handle_signals: false,
        }
    }

    /// Adds a task. Its dependencies are added implicitly.
    pub fn with_task<T: Task>(self) -> Self {
        self.with_descriptor(TaskDescriptor::of::<T>())
    }

    pub fn with_descriptor(mut self, descriptor: TaskDescriptor) -> Self {
        if !self.tasks.contains(&descriptor) {
            self.tasks.push(descriptor);
        }
        self
    }

    /// Also runs every task of `registry`, ahead of the ones added here.
    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a service-level option, stored under its bare name.
    pub fn with_option(mut self, spec: OptionSpec) -> Self {
        self.options.push(spec);
        self
    }

    /// Runs only the named tasks (and their dependencies) unless the
    /// `tasks` option says otherwise.
    pub fn with_selected_tasks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Calls `listener` on every task state change.
    pub fn with_lifecycle_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Treats SIGINT/SIGTERM (Ctrl-C on Windows) as a shutdown request.
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn build(self) -> ServiceDefinition {
        ServiceDefinition {
            inner: Arc::new(self),
        }
    }
}

/// Everything needed to create, and re-create on restart, a [`Service`].
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct ServiceDefinition {
    inner: Arc<ServiceBuilder>,
}

impl ServiceDefinition {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Tasks added with [`ServiceBuilder::with_task`].
    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.inner.tasks
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn selected_tasks(&self) -> Option<Vec<String>> {
        self.inner.selected.clone()
    }

    pub fn handles_signals(&self) -> bool {
        self.inner.handle_signals
    }

    pub(crate) fn listener(&self) -> Option<LifecycleListener> {
        self.inner.listener.clone()
    }

    /// Registry tasks, then added tasks, with all their dependencies, in
    /// creation order.
    pub fn descriptors(&self) -> Result<Vec<TaskDescriptor>, ConfigError> {
        let mut all = self.inner.registry.descriptors();
        for task in &self.inner.tasks {
            if !all.contains(task) {
                all.push(task.clone());
            }
        }
        resolve_dependencies(&all)
    }

    /// Registers the `tasks` option, the service options and the options of
    /// every task that could run, each with its default value.
    ///
    /// Fails if two of them end up with the same key.
    pub fn options(&self) -> Result<Options, ConfigError> {
        let options = Options::new();
        options.register(
            TASKS_OPTION,
            &OptionSpec::list(TASKS_OPTION).with_help("Tasks to run, all of them if unset"),
        )?;
        for spec in &self.inner.options {
            options.register(spec.name(), spec)?;
        }
        for task in self.descriptors()? {
            for spec in task.options() {
                options.register(task.option_key(spec.name()), &spec)?;
            }
        }
        Ok(options)
    }

    /// Creates and initializes a service without starting its tasks.
    pub async fn create(&self, options: Options) -> Result<Service, ServiceError> {
        Service::create(self, options).await
    }

    /// Runs the service until it is shut down, creating it again every time
    /// a restart was requested.
    ///
    /// `options` should come from [`ServiceDefinition::options`]; restarts
    /// reuse them.
    pub async fn run(&self, options: Options) -> Result<(), ServiceError> {
        loop {
            let service = match self.create(options.clone()).await {
                Ok(service) => service,
                Err(err) => {
                    tracing::error!(service = %self.name(), error = %err, kind = err.as_label(), "Unable to start service");
                    return Err(err);
                }
            };
            service.start();
            service.wait(self.handles_signals()).await;
            if !service.restart_requested() {
                break;
            }
            tracing::info!(service = %self.name(), "Restarting service");
        }
        tracing::info!(service = %self.name(), "Service shut down gracefully");
        Ok(())
    }

    /// Creates and starts the service, then supervises it on a spawned
    /// task so the caller is not blocked.
    ///
    /// Restart requests are honoured here too; [`ServiceRunner::service`]
    /// always returns the current incarnation.
    pub async fn start_background(&self, options: Options) -> Result<ServiceRunner, ServiceError> {
        let service = self.create(options.clone()).await?;
        service.start();
        Ok(ServiceRunner::spawn(self.clone(), options, service))
    }
}
