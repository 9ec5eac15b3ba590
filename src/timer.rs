use std::{fmt, future::Future, time::Duration};

use tokio::time::Instant;

/// Measures how long something took. Reads Tokio's clock, so it follows
/// paused time in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer that is already running.
    pub fn started() -> Self {
        let mut timer = Self::new();
        timer.start();
        timer
    }

    /// Starts or restarts the timer.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
    }

    pub fn stop(&mut self) {
        self.stopped = Some(Instant::now());
    }

    /// Zero before `start()`, time so far while running, total once stopped.
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.stopped) {
            (None, _) => Duration::ZERO,
            (Some(start), None) => start.elapsed(),
            (Some(start), Some(end)) => end.saturating_duration_since(start),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.elapsed())
    }
}

/// Polls `check` every millisecond until it returns true.
///
/// Returns `Err` with the configured timeout if `check` never succeeded.
pub async fn run_until_true<F>(mut check: F, timeout: Duration) -> Result<(), Duration>
where
    F: FnMut() -> bool,
{
    let timer = Timer::started();
    while timer.elapsed() < timeout {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Err(timeout)
}

/// Awaits `fut` but gives up after `timeout`.
pub(crate) async fn within<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(t) => tokio::time::timeout(t, fut).await.ok(),
        None => Some(fut.await),
    }
}
