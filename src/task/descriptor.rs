use std::{
    any::TypeId,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    options::{option_key, OptionSpec},
    task::{CreatedTask, Task, TaskContext, TaskError},
};

struct Descriptor {
    type_id: TypeId,
    name: &'static str,
    opt_prefix: Option<&'static str>,
    loopless: bool,
    workers: usize,
    deps: fn() -> Vec<TaskDescriptor>,
    options: fn() -> Vec<OptionSpec>,
    create: fn(TaskContext) -> Result<CreatedTask, TaskError>,
}

/// Type-level description of a [`Task`]: everything the service needs
/// before an instance exists.
///
/// Two descriptors are equal when they describe the same Rust type.
#[derive(Clone)]
pub struct TaskDescriptor {
    inner: Arc<Descriptor>,
}

fn create_task<T: Task>(ctx: TaskContext) -> Result<CreatedTask, TaskError> {
    let task = Arc::new(T::create(ctx)?);
    Ok(CreatedTask {
        task: task.clone(),
        any: task,
    })
}

impl TaskDescriptor {
    pub fn of<T: Task>() -> Self {
        Self {
            inner: Arc::new(Descriptor {
                type_id: TypeId::of::<T>(),
                name: T::NAME,
                opt_prefix: T::OPT_PREFIX,
                loopless: T::LOOPLESS,
                workers: T::WORKERS,
                deps: T::deps,
                options: T::options,
                create: create_task::<T>,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Prefix of this task's option keys.
    pub fn opt_prefix(&self) -> &'static str {
        self.inner.opt_prefix.unwrap_or(self.inner.name)
    }

    pub fn is_loopless(&self) -> bool {
        self.inner.loopless
    }

    /// Default worker count; the instance may still choose another one.
    pub fn default_workers(&self) -> usize {
        self.inner.workers
    }

    pub fn deps(&self) -> Vec<TaskDescriptor> {
        (self.inner.deps)()
    }

    pub fn options(&self) -> Vec<OptionSpec> {
        (self.inner.options)()
    }

    /// Namespaced key of this task's option `name`.
    pub fn option_key(&self, name: &str) -> String {
        option_key(Some(self.opt_prefix()), name)
    }

    pub fn is<T: Task>(&self) -> bool {
        self.inner.type_id == TypeId::of::<T>()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.inner.type_id
    }

    pub(crate) fn create(&self, ctx: TaskContext) -> Result<CreatedTask, TaskError> {
        (self.inner.create)(ctx)
    }
}

impl PartialEq for TaskDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.type_id == other.inner.type_id
    }
}

impl Eq for TaskDescriptor {}

impl Hash for TaskDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.type_id.hash(state);
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskDescriptor").field(&self.inner.name).finish()
    }
}

impl fmt::Display for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner.name)
    }
}
