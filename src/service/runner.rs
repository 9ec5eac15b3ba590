use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ServiceError,
    options::Options,
    service::{builder::ServiceDefinition, Service},
};

/// A service supervised on a spawned Tokio task.
///
/// Returned by [`ServiceDefinition::start_background`].
pub struct ServiceRunner {
    current: watch::Receiver<Service>,
    // Shared by every incarnation; set once a stop is requested.
    stop: CancellationToken,
    join_handle: JoinHandle<Result<(), ServiceError>>,
}

impl ServiceRunner {
    pub(crate) fn spawn(definition: ServiceDefinition, options: Options, service: Service) -> Self {
        let (tx, current) = watch::channel(service.clone());
        let stop = CancellationToken::new();
        let runner_stop = stop.clone();
        let join_handle = tokio::spawn(async move {
            let mut service = service;
            loop {
                {
                    let wait = service.wait(definition.handles_signals());
                    tokio::pin!(wait);
                    tokio::select! {
                        _ = &mut wait => {}
                        _ = runner_stop.cancelled() => {
                            service.shutdown();
                            wait.await;
                        }
                    }
                }
                if runner_stop.is_cancelled() || !service.restart_requested() {
                    break;
                }
                tracing::info!(service = %definition.name(), "Restarting service");
                service = definition.create(options.clone()).await?;
                if !runner_stop.is_cancelled() {
                    service.start();
                }
                tx.send_replace(service.clone());
            }
            tracing::info!(service = %definition.name(), "Service shut down gracefully");
            Ok(())
        });
        Self {
            current,
            stop,
            join_handle,
        }
    }

    /// The current incarnation of the service.
    pub fn service(&self) -> Service {
        self.current.borrow().clone()
    }

    /// Requests a graceful stop. Use [`ServiceRunner::wait`] to wait for it.
    pub fn shutdown(&self) {
        self.stop.cancel();
        self.service().shutdown();
    }

    pub fn restart(&self) {
        self.service().restart();
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Waits until the service has stopped for good.
    pub async fn wait(self) -> Result<(), ServiceError> {
        self.join_handle.await?
    }
}
