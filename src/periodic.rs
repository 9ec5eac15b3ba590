//! Runs a job on a fixed interval.
//!
//! Each cycle sleeps until its own start plus the interval, so a slow
//! iteration never makes the following ones drift. An iteration that
//! overruns the interval is counted in `n_slow_iterations` and the next one
//! starts immediately.

use std::{
    future::Future,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use crate::{
    context::{unshare, Completion, CompletionSink},
    counters::{Aggregate, Counter, Samples},
    error::{CompletionError, ConfigError},
    options::{OptionSpec, OptionValue},
    task::{
        ExecuteError, InitResult, Task, TaskContext, TaskDescriptor, TaskError,
        TaskResult, Worker,
    },
    timer::Timer,
};

/// Windows, in seconds, of the `execute_duration_ms` series.
const DURATION_WINDOWS: [u64; 2] = [60, 240];

/// A job run by the [`Periodic`] engine.
pub trait PeriodicJob: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    const OPT_PREFIX: Option<&'static str> = None;

    /// Default of the `interval` option, in seconds. Without one, the
    /// option has to be set or the task fails to initialize.
    const INTERVAL: Option<f64> = None;

    const WORKERS: usize = 1;

    /// Result of one execution, handed to every pending [`Periodic::submit`].
    type Output: Clone + Send + Sync + 'static;

    fn deps() -> Vec<TaskDescriptor> {
        Vec::new()
    }

    fn options() -> Vec<OptionSpec> {
        Vec::new()
    }

    fn create(ctx: &TaskContext) -> Result<Self, TaskError>;

    fn init(&self) -> impl Future<Output = InitResult> + Send {
        async { Ok(()) }
    }

    fn execute(&self) -> impl Future<Output = Result<Self::Output, ExecuteError>> + Send;

    fn stop(&self) {}
}

struct Pending<O> {
    // Live workers; submissions are refused while it is zero.
    running: usize,
    sinks: Vec<CompletionSink<O>>,
}

/// Counts a worker as running until dropped, unwinding included.
struct RunningGuard<'a, J: PeriodicJob>(&'a Periodic<J>);

impl<J: PeriodicJob> Drop for RunningGuard<'_, J> {
    fn drop(&mut self) {
        self.0.worker_exited();
    }
}

/// Task running a [`PeriodicJob`] every `interval` seconds.
pub struct Periodic<J: PeriodicJob> {
    job: J,
    ctx: TaskContext,
    interval: OnceLock<Duration>,
    pending: Mutex<Pending<J::Output>>,
    n_iterations: Arc<Counter>,
    n_slow_iterations: Arc<Counter>,
    n_try_later: Arc<Counter>,
    execute_duration_ms: Arc<Samples>,
}

impl<J: PeriodicJob> Periodic<J> {
    fn pending(&self) -> MutexGuard<'_, Pending<J::Output>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Current interval. Changes to the `interval` option apply from the
    /// next cycle on.
    pub fn interval(&self) -> Duration {
        match self.ctx.option_f64("interval") {
            Ok(Some(secs)) if secs > 0.0 => Duration::from_secs_f64(secs),
            _ => self.interval.get().copied().unwrap_or_default(),
        }
    }

    pub fn iterations(&self) -> u64 {
        self.n_iterations.value().unwrap_or(0.0) as u64
    }

    pub fn slow_iterations(&self) -> u64 {
        self.n_slow_iterations.value().unwrap_or(0.0) as u64
    }

    pub fn try_later_count(&self) -> u64 {
        self.n_try_later.value().unwrap_or(0.0) as u64
    }

    /// Waits for the result of the next execution.
    ///
    /// Every submission pending when an execution finishes gets that
    /// execution's result; submissions do not cause extra executions. If the
    /// task is not running, the completion fails right away with
    /// [`CompletionError::NotRunning`].
    pub fn submit(&self) -> Completion<J::Output> {
        let mut pending = self.pending();
        if pending.running == 0 {
            return Completion::failed(CompletionError::NotRunning);
        }
        let (sink, completion) = Completion::channel();
        pending.sinks.push(sink);
        completion
    }

    fn deliver(&self, result: Result<J::Output, CompletionError>) {
        let sinks = std::mem::take(&mut self.pending().sinks);
        for sink in sinks {
            match &result {
                Ok(output) => sink.succeed(output.clone()),
                Err(err) => sink.fail(err.clone()),
            };
        }
    }

    fn worker_started(&self) -> RunningGuard<'_, J> {
        self.pending().running += 1;
        RunningGuard(self)
    }

    fn worker_exited(&self) {
        let sinks = {
            let mut pending = self.pending();
            pending.running = pending.running.saturating_sub(1);
            if pending.running > 0 {
                Vec::new()
            } else {
                std::mem::take(&mut pending.sinks)
            }
        };
        for sink in sinks {
            sink.fail(CompletionError::NotRunning);
        }
    }

    async fn run_loop(&self) -> TaskResult {
        let mut timer = Timer::started();
        while !self.ctx.is_stopping() {
            let output = match self.job.execute().await {
                Ok(output) => output,
                Err(ExecuteError::TryLater(delay)) => {
                    self.n_try_later.increment();
                    tracing::debug!(?delay, "Execution postponed");
                    match delay {
                        Some(delay) => {
                            if self.ctx.sleep(delay).await {
                                break;
                            }
                        }
                        None => tokio::task::yield_now().await,
                    }
                    continue;
                }
                Err(ExecuteError::Failed(err)) => {
                    let err = Arc::new(err);
                    self.deliver(Err(CompletionError::Failed(err.clone())));
                    return Err(unshare(err));
                }
            };

            self.n_iterations.increment();
            self.execute_duration_ms.add(timer.elapsed_ms());
            self.deliver(Ok(output));

            match self.interval().checked_sub(timer.elapsed()) {
                Some(to_sleep) if !to_sleep.is_zero() => {
                    if self.ctx.sleep(to_sleep).await {
                        break;
                    }
                }
                _ => {
                    self.n_slow_iterations.increment();
                    tracing::debug!(elapsed = %timer, "Slow iteration");
                }
            }
            timer.start();
        }
        Ok(())
    }
}

impl<J: PeriodicJob> Deref for Periodic<J> {
    type Target = J;

    fn deref(&self) -> &J {
        &self.job
    }
}

impl<J: PeriodicJob> Task for Periodic<J> {
    const NAME: &'static str = J::NAME;
    const OPT_PREFIX: Option<&'static str> = J::OPT_PREFIX;
    const WORKERS: usize = J::WORKERS;

    fn deps() -> Vec<TaskDescriptor> {
        J::deps()
    }

    fn options() -> Vec<OptionSpec> {
        let mut options = J::options();
        options.push(
            OptionSpec::float("interval")
                .with_late_default(|| J::INTERVAL.map(OptionValue::Float))
                .with_help("How often to execute, in seconds"),
        );
        options
    }

    fn create(ctx: TaskContext) -> Result<Self, TaskError> {
        let counters = ctx.counters();
        let n_iterations = counters.sum("n_iterations");
        let n_slow_iterations = counters.sum("n_slow_iterations");
        let n_try_later = counters.sum("n_try_later");
        let execute_duration_ms = counters.samples(
            "execute_duration_ms",
            &[Aggregate::Average, Aggregate::Max, Aggregate::Min],
            &DURATION_WINDOWS,
        );
        Ok(Self {
            job: J::create(&ctx)?,
            ctx,
            interval: OnceLock::new(),
            pending: Mutex::new(Pending {
                running: 0,
                sinks: Vec::new(),
            }),
            n_iterations,
            n_slow_iterations,
            n_try_later,
            execute_duration_ms,
        })
    }

    async fn init(&self) -> InitResult {
        let interval = self
            .ctx
            .option_f64("interval")?
            .filter(|secs| *secs > 0.0)
            .ok_or_else(|| ConfigError::MissingInterval {
                task: J::NAME.to_string(),
            })?;
        let _ = self.interval.set(Duration::from_secs_f64(interval));
        self.job.init().await
    }

    async fn run(&self, _worker: &Worker) -> TaskResult {
        let _running = self.worker_started();
        self.run_loop().await
    }

    fn stop(&self) {
        self.job.stop();
    }
}
