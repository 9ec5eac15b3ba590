use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::{
    counters::CounterSet,
    error::OptionError,
    options::{option_key, OptionValue, Options},
    service::ServiceHandle,
    task::TaskDescriptor,
};

struct Context {
    name: &'static str,
    opt_prefix: &'static str,
    logger: String,
    service: ServiceHandle,
    options: Options,
    counters: Arc<CounterSet>,
    stop: CancellationToken,
    service_stop: CancellationToken,
    span: Span,
}

/// What a task instance gets from its service: its options, its counters,
/// its stop signal and a way back to the service.
///
/// Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Context>,
}

impl TaskContext {
    pub(crate) fn new(
        descriptor: &TaskDescriptor,
        service_name: &str,
        service: ServiceHandle,
        options: Options,
        service_stop: CancellationToken,
    ) -> Self {
        let logger = format!("{service_name}.{}", descriptor.name());
        let span = tracing::info_span!("task", logger = %logger);
        Self {
            inner: Arc::new(Context {
                name: descriptor.name(),
                opt_prefix: descriptor.opt_prefix(),
                logger,
                service,
                options,
                counters: Arc::new(CounterSet::new()),
                stop: CancellationToken::new(),
                service_stop,
                span,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// `<service>.<task>`, recorded on the task's tracing span.
    pub fn logger(&self) -> &str {
        &self.inner.logger
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.inner.service
    }

    /// The service-wide options namespace.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn counters(&self) -> &CounterSet {
        &self.inner.counters
    }

    pub(crate) fn counter_set(&self) -> Arc<CounterSet> {
        self.inner.counters.clone()
    }

    /// Key of this task's option `name` in the service namespace.
    pub fn option_key(&self, name: &str) -> String {
        option_key(Some(self.inner.opt_prefix), name)
    }

    /// Reads this task's option `name`.
    pub fn option(&self, name: &str) -> Result<Option<OptionValue>, OptionError> {
        self.inner.options.get(&self.option_key(name))
    }

    pub fn option_f64(&self, name: &str) -> Result<Option<f64>, OptionError> {
        Ok(self.option(name)?.and_then(|v| v.as_f64()))
    }

    pub fn option_usize(&self, name: &str) -> Result<Option<usize>, OptionError> {
        Ok(self
            .option(name)?
            .and_then(|v| v.as_i64())
            .map(|v| v.max(0) as usize))
    }

    pub fn set_option(&self, name: &str, value: impl Into<OptionValue>) -> Result<(), OptionError> {
        self.inner.options.set(&self.option_key(name), value)
    }

    /// Cancelled when this task is asked to stop.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.inner.stop
    }

    /// True once either this task or the whole service is stopping.
    pub fn is_stopping(&self) -> bool {
        self.inner.stop.is_cancelled() || self.inner.service_stop.is_cancelled()
    }

    /// Resolves once either this task or the whole service is stopping.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.inner.stop.cancelled() => {}
            _ = self.inner.service_stop.cancelled() => {}
        }
    }

    /// Sleeps for `duration` unless asked to stop first.
    ///
    /// Returns true if the task is stopping.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => true,
            _ = tokio::time::sleep(duration) => self.is_stopping(),
        }
    }

    pub(crate) fn cancel(&self) {
        self.inner.stop.cancel();
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("logger", &self.inner.logger)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
