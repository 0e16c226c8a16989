//! Background sweeper
//!
//! One low-frequency task evicts timed-out deferred requests and expires
//! idle sessions.

use crate::orchestrator::Orchestrator;
use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a running sweeper
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the current pass to finish
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "sweeper terminated abnormally");
        }
    }

    /// Whether the sweeper task has ended
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start sweeping every `sweep_interval` of the orchestrator's config
///
/// # Panics
/// Panics when called outside a tokio runtime
#[must_use]
pub fn spawn_sweeper(orchestrator: Orchestrator) -> SweeperHandle {
    let period = orchestrator.config().sweep_interval();
    let (stop, mut stopped) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(period_ms = period.as_millis(), "sweeper started");

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let evicted = orchestrator.sweep_deferred(now).await;
                    let expired = orchestrator.sweep_sessions(now).await;
                    if evicted > 0 || !expired.is_empty() {
                        tracing::info!(evicted, expired = expired.len(), "sweep pass");
                    }
                }
            }
        }
        tracing::debug!("sweeper stopped");
    });

    SweeperHandle {
        stop: Some(stop),
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::Collaborators;
    use crate::store::FsConfigStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::new();
        config.sweep_interval_ms = 10;
        let orchestrator = Orchestrator::new(
            config,
            Collaborators::new(Arc::new(FsConfigStore::new(dir.path()))),
        )
        .unwrap();

        let handle = spawn_sweeper(orchestrator.clone());
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        handle.shutdown().await;
        orchestrator.shutdown().await;
    }
}
