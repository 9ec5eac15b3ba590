//! A periodic producer feeding a queue consumer.
//!
//! Run with `RUST_LOG=info cargo run --example producer_consumer` and stop it
//! with Ctrl-C.

use std::sync::atomic::{AtomicU64, Ordering};

use taskhost::{
    ExecuteError, Periodic, PeriodicJob, QueueTask, QueueWorker, ServiceBuilder, TaskContext,
    TaskDescriptor, Work,
};

struct Squarer;

impl QueueWorker for Squarer {
    const NAME: &'static str = "Squarer";
    const WORKERS: usize = 2;
    type Item = u64;
    type Output = u64;

    fn create(_ctx: &TaskContext) -> anyhow::Result<Self> {
        Ok(Squarer)
    }

    async fn execute(&self, item: &u64, ctx: &Work<Self>) -> Result<u64, ExecuteError> {
        // Odd numbers need a second look.
        if item % 2 == 1 && ctx.attempt() == 1 {
            return Err(ExecuteError::try_later());
        }
        tracing::info!(item, attempt = ctx.attempt(), "Squared {}", item * item);
        Ok(item * item)
    }
}

struct Producer {
    ctx: TaskContext,
    next: AtomicU64,
}

impl PeriodicJob for Producer {
    const NAME: &'static str = "Producer";
    const INTERVAL: Option<f64> = Some(1.0);
    type Output = u64;

    fn deps() -> Vec<TaskDescriptor> {
        vec![TaskDescriptor::of::<QueueTask<Squarer>>()]
    }

    fn create(ctx: &TaskContext) -> anyhow::Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            next: AtomicU64::new(1),
        })
    }

    async fn execute(&self) -> Result<u64, ExecuteError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let squarer = self.ctx.service().require::<QueueTask<Squarer>>()?;
        let squared = squarer.submit(n).await.await.map_err(anyhow::Error::from)?;
        self.ctx
            .service()
            .set_exported_value("last_square", Some(squared.to_string()))?;
        Ok(squared)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let definition = ServiceBuilder::new("squares")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_task::<Periodic<Producer>>()
        .with_signal_handlers(true)
        .build();

    let options = definition.options()?;
    for info in options.describe() {
        tracing::info!(flag = %info.flag, kind = %info.kind, value = ?info.value, "Option");
    }
    definition.run(options).await?;
    Ok(())
}
