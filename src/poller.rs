//! Periodically fetches a value and notices when it changes.

use std::{fmt, future::Future, time::Duration};

use tokio::sync::watch;

use crate::{
    options::OptionSpec,
    periodic::{Periodic, PeriodicJob},
    task::{ExecuteError, InitResult, TaskContext, TaskDescriptor, TaskError},
    timer::within,
};

/// A source polled by a [`PollerTask`].
pub trait PollJob: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    const OPT_PREFIX: Option<&'static str> = None;
    const INTERVAL: Option<f64> = None;

    type Value: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

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

    /// Reads the current value.
    fn fetch(&self) -> impl Future<Output = Result<Self::Value, ExecuteError>> + Send;

    /// Called after a fetch returned something other than the previous
    /// value. `old` is `None` on the first fetch.
    fn on_value_changed(&self, old: Option<&Self::Value>, new: &Self::Value) {
        let _ = (old, new);
    }
}

/// [`PeriodicJob`] adapter keeping the last fetched value of a [`PollJob`].
pub struct Poller<P: PollJob> {
    source: P,
    current: watch::Sender<Option<P::Value>>,
}

/// Task polling `P` every `interval` seconds.
pub type PollerTask<P> = Periodic<Poller<P>>;

impl<P: PollJob> Poller<P> {
    pub fn source(&self) -> &P {
        &self.source
    }

    /// The last fetched value, `None` before the first fetch.
    pub fn current_value(&self) -> Option<P::Value> {
        self.current.borrow().clone()
    }

    /// Waits until a value has been fetched, at most `timeout` if given.
    pub async fn value(&self, timeout: Option<Duration>) -> Option<P::Value> {
        let mut rx = self.current.subscribe();
        within(timeout, async move {
            let value = rx.wait_for(Option::is_some).await.ok()?.clone();
            value
        })
        .await
        .flatten()
    }
}

impl<P: PollJob> PeriodicJob for Poller<P> {
    const NAME: &'static str = P::NAME;
    const OPT_PREFIX: Option<&'static str> = P::OPT_PREFIX;
    const INTERVAL: Option<f64> = P::INTERVAL;

    type Output = P::Value;

    fn deps() -> Vec<TaskDescriptor> {
        P::deps()
    }

    fn options() -> Vec<OptionSpec> {
        P::options()
    }

    fn create(ctx: &TaskContext) -> Result<Self, TaskError> {
        let (current, _) = watch::channel(None);
        Ok(Self {
            source: P::create(ctx)?,
            current,
        })
    }

    async fn init(&self) -> InitResult {
        self.source.init().await
    }

    async fn execute(&self) -> Result<P::Value, ExecuteError> {
        let new = self.source.fetch().await?;
        let old = self.current_value();
        if old.as_ref() != Some(&new) {
            tracing::debug!(?old, ?new, "Polled value changed");
            self.source.on_value_changed(old.as_ref(), &new);
        }
        self.current.send_replace(Some(new.clone()));
        Ok(new)
    }
}
