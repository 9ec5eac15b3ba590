//! Shutdown signals: SIGINT and SIGTERM on Unix, Ctrl-C elsewhere.
//!
//! If the handlers cannot be installed the returned future never resolves,
//! leaving `shutdown()` as the only way to stop the service.

#[cfg(unix)]
pub(crate) async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(error = %err, "Unable to install signal handlers");
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
pub(crate) async fn shutdown_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(err) => {
            tracing::warn!(error = %err, "Unable to install signal handlers");
            std::future::pending().await
        }
    }
}
