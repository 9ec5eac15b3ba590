//! # taskhost
//!
//! `taskhost` hosts a set of long-running tasks inside one Tokio process.
//! It creates them in dependency order, starts their workers, and on
//! shutdown stops and joins them in reverse order. A service can restart in
//! place, and a task that crashes takes the whole service down with it
//! instead of leaving it half alive.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use taskhost::{ExecuteError, PeriodicJob, Periodic, ServiceBuilder, TaskContext};
//!
//! struct Heartbeat;
//!
//! impl PeriodicJob for Heartbeat {
//!     const NAME: &'static str = "Heartbeat";
//!     const INTERVAL: Option<f64> = Some(5.0);
//!     type Output = ();
//!
//!     fn create(_ctx: &TaskContext) -> anyhow::Result<Self> {
//!         Ok(Heartbeat)
//!     }
//!
//!     async fn execute(&self) -> Result<(), ExecuteError> {
//!         tracing::info!("still alive");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let definition = ServiceBuilder::new("pulse")
//!         .with_task::<Periodic<Heartbeat>>()
//!         .with_signal_handlers(true)
//!         .build();
//!
//!     let options = definition.options()?;
//!     definition.run(options).await?;   // until Ctrl-C, SIGTERM or shutdown()
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Dependency ordering**: tasks declare `deps()`; init and start follow
//!   dependency order, stop and join the reverse. Cycles are reported.
//! * **Engines**: [`Periodic`] (drift-free interval loop with retry),
//!   [`QueueTask`] (FIFO, priority or duplicate-suppressing work queue with
//!   retry by requeue) and [`PollerTask`] (change detection on top of
//!   `Periodic`).
//! * **Options and counters**: every task owns namespaced, typed options and
//!   a set of counters, aggregated service-wide.
//! * **Fail-fast workers**: a worker error or panic shuts the service down.
//!
//! ## API overview
//!
//! | Service method                  | Purpose                                                  |
//! | ------------------------------- | -------------------------------------------------------- |
//! | `shutdown()`                    | Stop every task and exit                                 |
//! | `restart()`                     | Stop every task, then create them again                  |
//! | `require::<T>()`                | Look up a task instance by type                          |
//! | `require_task(name)`            | Look up a task handle by name                            |
//! | `register_warning(message)`     | Record a health warning, returns its id                  |
//! | `set_exported_value(key, v)`    | Publish a status string                                  |
//! | `all_counters()`                | Every counter, as `<task>.<counter>`                     |
//! | `status()`                      | `Starting`, `Alive`, `Warning`, `Stopping` or `Stopped`  |

pub use context::{Completion, CompletionSink, ExecuteContext};
pub use counters::{
    Aggregate, Clock, Counter, CounterSet, ManualClock, Samples, SystemClock,
};
pub use error::{CompletionError, ConfigError, OptionError, QueueError, ServiceError};
pub use options::{
    flag_name, option_key, OptionInfo, OptionKind, OptionSpec, OptionValue, Options,
};
pub use periodic::{Periodic, PeriodicJob};
pub use poller::{PollJob, Poller, PollerTask};
pub use queue::{
    priority_queue, unique_queue, DuplicatePolicy, QueueTask, QueueWorker, Work, WorkQueue,
};
pub use service::{
    builder::{ServiceBuilder, ServiceDefinition},
    runner::ServiceRunner,
    Service, ServiceHandle, ServiceStatus,
};
pub use task::{
    resolve_dependencies, ExecuteError, InitError, InitResult, LifecycleEvent,
    LifecycleListener, Task, TaskCollection, TaskContext, TaskDescriptor, TaskError, TaskHandle,
    TaskRegistry, TaskResult, TaskState, Worker,
};
pub use timer::{run_until_true, Timer};

mod context;
mod counters;
mod error;
mod options;
mod periodic;
mod poller;
mod queue;
mod service;
mod task;
mod timer;
