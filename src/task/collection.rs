use std::{
    any::TypeId,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    error::{ConfigError, ServiceError},
    task::{Task, TaskDescriptor, TaskHandle},
};

/// Flattens `tasks` and their transitive dependencies into an order in
/// which every task comes after all of its dependencies.
///
/// Depth-first: each task's dependencies are visited in declaration order
/// and a task is appended the first time it is reached. The result holds
/// no duplicates, and resolving an already resolved list returns it
/// unchanged.
///
/// ```rust
/// use taskhost::{resolve_dependencies, Task, TaskContext, TaskDescriptor};
///
/// struct A;
/// struct B;
///
/// impl Task for A {
///     const NAME: &'static str = "A";
///     fn deps() -> Vec<TaskDescriptor> {
///         vec![TaskDescriptor::of::<B>()]
///     }
///     fn create(_: TaskContext) -> anyhow::Result<Self> {
///         Ok(A)
///     }
/// }
///
/// impl Task for B {
///     const NAME: &'static str = "B";
///     fn create(_: TaskContext) -> anyhow::Result<Self> {
///         Ok(B)
///     }
/// }
///
/// let order = resolve_dependencies(&[TaskDescriptor::of::<A>()]).unwrap();
/// let names: Vec<_> = order.iter().map(|t| t.name()).collect();
/// assert_eq!(names, ["B", "A"]);
/// ```
pub fn resolve_dependencies(tasks: &[TaskDescriptor]) -> Result<Vec<TaskDescriptor>, ConfigError> {
    let mut resolved = Vec::new();
    let mut path = Vec::new();
    for task in tasks {
        visit(task, &mut path, &mut resolved)?;
    }
    Ok(resolved)
}

fn visit(
    task: &TaskDescriptor,
    path: &mut Vec<TaskDescriptor>,
    resolved: &mut Vec<TaskDescriptor>,
) -> Result<(), ConfigError> {
    if resolved.contains(task) {
        return Ok(());
    }
    if let Some(pos) = path.iter().position(|t| t == task) {
        let mut cycle: Vec<String> = path[pos..].iter().map(|t| t.name().to_string()).collect();
        cycle.push(task.name().to_string());
        return Err(ConfigError::DependencyCycle { path: cycle });
    }
    path.push(task.clone());
    for dep in task.deps() {
        visit(&dep, path, resolved)?;
    }
    path.pop();
    resolved.push(task.clone());
    Ok(())
}

/// Tasks made available to every service built with this registry.
///
/// Insertion-ordered; registering the same type twice keeps the first.
/// Cloning is cheap; clones share the same set.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<Vec<TaskDescriptor>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task>(&self) -> &Self {
        self.register_descriptor(TaskDescriptor::of::<T>())
    }

    pub fn register_descriptor(&self, descriptor: TaskDescriptor) -> &Self {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.contains(&descriptor) {
            tasks.push(descriptor);
        }
        self
    }

    pub fn contains<T: Task>(&self) -> bool {
        self.descriptors().iter().any(|t| t.is::<T>())
    }

    pub fn descriptors(&self) -> Vec<TaskDescriptor> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.descriptors()).finish()
    }
}

/// The tasks of one service: first the registered descriptors, then, once
/// the service created them, the instances in dependency order.
#[derive(Debug, Default)]
pub struct TaskCollection {
    registered: Vec<TaskDescriptor>,
    created: Option<Vec<Arc<TaskHandle>>>,
}

impl TaskCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `descriptor` unless the same task is already registered.
    pub fn register(&mut self, descriptor: TaskDescriptor) {
        if !self.registered.contains(&descriptor) {
            self.registered.push(descriptor);
        }
    }

    pub fn register_all(&mut self, descriptors: impl IntoIterator<Item = TaskDescriptor>) {
        for descriptor in descriptors {
            self.register(descriptor);
        }
    }

    /// Removes the task called `name`. Returns false if it was not registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.registered.len();
        self.registered.retain(|t| t.name() != name);
        self.registered.len() != before
    }

    /// Keeps only the registered tasks named in `names`.
    ///
    /// Dependencies of the selected tasks are brought back in when the
    /// tasks are created.
    pub fn select<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ConfigError> {
        let available = self.names();
        if names.is_empty() {
            return Err(ConfigError::NoTasksSelected { available });
        }
        for name in names {
            if !available.iter().any(|a| a == name.as_ref()) {
                return Err(ConfigError::UnknownTask {
                    name: name.as_ref().to_string(),
                    available,
                });
            }
        }
        self.registered
            .retain(|t| names.iter().any(|n| n.as_ref() == t.name()));
        Ok(())
    }

    pub fn descriptors(&self) -> &[TaskDescriptor] {
        &self.registered
    }

    pub fn descriptor(&self, name: &str) -> Option<&TaskDescriptor> {
        self.registered.iter().find(|t| t.name() == name)
    }

    /// Names of the registered tasks, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registered.iter().map(|t| t.name().to_string()).collect()
    }

    /// Registered tasks and their dependencies in creation order.
    pub fn resolve(&self) -> Result<Vec<TaskDescriptor>, ConfigError> {
        resolve_dependencies(&self.registered)
    }

    pub fn is_created(&self) -> bool {
        self.created.is_some()
    }

    /// Created instances in dependency order; empty before creation.
    pub fn handles(&self) -> Vec<Arc<TaskHandle>> {
        self.created.clone().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.created.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskHandle>> {
        self.created
            .as_ref()?
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<TaskHandle>, ServiceError> {
        if !self.is_created() {
            return Err(ServiceError::NotCreated);
        }
        self.get(name)
            .ok_or_else(|| ServiceError::TaskNotFound(name.to_string()))
    }

    pub fn get_typed<T: Task>(&self) -> Option<Arc<T>> {
        self.created
            .as_ref()?
            .iter()
            .find(|h| h.descriptor().type_id() == TypeId::of::<T>())
            .and_then(|h| h.downcast::<T>())
    }

    pub fn require_typed<T: Task>(&self) -> Result<Arc<T>, ServiceError> {
        if !self.is_created() {
            return Err(ServiceError::NotCreated);
        }
        self.get_typed::<T>()
            .ok_or_else(|| ServiceError::TaskNotFound(T::NAME.to_string()))
    }

    pub(crate) fn install(&mut self, handles: Vec<Arc<TaskHandle>>) {
        self.created = Some(handles);
    }

    pub(crate) fn remove(&mut self, name: &str) {
        if let Some(created) = &mut self.created {
            created.retain(|h| h.name() != name);
        }
    }
}
