//! Startup recovery and shutdown coordination.

use std::sync::atomic::Ordering;
use std::time::Duration;

use super::Uplink;
use crate::error::{Error, Result};
use crate::types::{ArtifactId, Event};

/// How often shutdown re-checks the set of running transfers
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Uplink {
    /// Hand records left `in_flight` by a previous run back to the queue
    ///
    /// Runs once while the instance is being built, before any worker exists,
    /// holding the store gate so no producer write interleaves.
    pub(crate) async fn recover_in_flight(&self) -> Result<Vec<ArtifactId>> {
        let _gate = self.store_gate.write().await;

        let reclaimed = self.db.reclaim_all_in_flight().await?;
        if !reclaimed.is_empty() {
            tracing::info!(
                count = reclaimed.len(),
                "Recovered artifacts interrupted by the previous run"
            );
        }
        for id in &reclaimed {
            tracing::debug!(artifact_id = id.0, "Reclaimed in-flight artifact");
            self.emit_event(Event::Reclaimed { id: *id });
        }

        Ok(reclaimed)
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        !self.queue_state.accepting_new.load(Ordering::SeqCst)
    }

    /// Gracefully shut down the uplink
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new submissions
    /// 2. Stops the scheduler and background services
    /// 3. Cancels every running transfer; each persists its resume point and
    ///    requeues itself without penalty
    /// 4. Waits up to `shutdown_grace` for the transfers to finish
    /// 5. Marks the store as cleanly shut down
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimedOut`] when transfers are still running
    /// after the grace period. The store is then left marked as unclean and the
    /// stragglers are reclaimed on the next start.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new artifacts
        self.queue_state.accepting_new.store(false, Ordering::SeqCst);
        self.emit_event(Event::Shutdown);

        // 2. Stop the scheduler and services
        self.signals.shutdown.cancel();

        // 3. Cancel running transfers
        self.cancel_all_active().await;

        // 4. Wait for them with the configured grace period
        let grace = self.config.scheduler.shutdown_grace;
        if tokio::time::timeout(grace, self.wait_for_active_uploads())
            .await
            .is_err()
        {
            let in_flight = self.queue_state.active_uploads.lock().await.len();
            tracing::error!(
                in_flight,
                grace_secs = grace.as_secs(),
                "Shutdown grace period elapsed with transfers still running"
            );
            return Err(Error::ShutdownTimedOut { in_flight });
        }
        tracing::info!("All active transfers stopped");

        if let Some(fatal) = self.fatal_as_error() {
            tracing::error!(error = %fatal, "Leaving store marked unclean after fatal failure");
            return Ok(());
        }

        // 5. Mark clean shutdown in the store
        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in store");
            return Err(e);
        }

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Signal cancellation to every running transfer
    pub(crate) async fn cancel_all_active(&self) {
        let active = self.queue_state.active_uploads.lock().await;
        tracing::debug!(active_count = active.len(), "Cancelling active transfers");

        for (id, upload) in active.iter() {
            tracing::debug!(artifact_id = id.0, "Signaling cancellation");
            upload.cancel.cancel();
        }
    }

    async fn wait_for_active_uploads(&self) {
        loop {
            let active_count = self.queue_state.active_uploads.lock().await.len();
            if active_count == 0 {
                return;
            }

            tracing::debug!(active_count, "Waiting for active transfers to stop");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
