use crate::orchestrator::CleanupOrchestrator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to the periodic sampling task started by [`spawn_monitor`].
///
/// Dropping the handle cancels the task without waiting for it; use
/// [`MonitorHandle::stop`] to wait for an in-flight tick to finish.
pub struct MonitorHandle {
    token: CancellationToken,
    ticks: Arc<AtomicU64>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Tick `orchestrator` every `interval` on the current tokio runtime.
///
/// The first tick happens immediately. A tick that overruns the interval
/// delays the next one rather than bunching ticks up. Must be called from
/// within a runtime.
pub fn spawn_monitor(orchestrator: CleanupOrchestrator, interval: Duration) -> MonitorHandle {
    let token = CancellationToken::new();
    let ticks = Arc::new(AtomicU64::new(0));

    let token_for_task = token.clone();
    let ticks_for_task = Arc::clone(&ticks);
    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(
            target: "reclaim.memory",
            interval_ms = interval.as_millis() as u64,
            "memory monitor started"
        );

        loop {
            tokio::select! {
                _ = token_for_task.cancelled() => break,
                _ = timer.tick() => {}
            }
            // A pass that has started is allowed to finish before the
            // cancellation is observed.
            orchestrator.tick().await;
            ticks_for_task.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(target: "reclaim.memory", "memory monitor stopped");
    });

    MonitorHandle {
        token,
        ticks,
        task: Some(task),
    }
}

impl MonitorHandle {
    /// Number of ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(
                    target: "reclaim.memory",
                    error = %err,
                    "memory monitor task ended abnormally"
                );
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("ticks", &self.ticks())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
