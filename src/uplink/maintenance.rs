//! Retention pruning and stale-claim sweeping.

use std::path::Path;

use super::Uplink;
use crate::error::Result;
use crate::types::{ArtifactState, Event};
use crate::utils::now_millis;

/// Outcome of one pruning pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Delivered records removed
    pub done: usize,
    /// Dead-lettered records removed
    pub dead: usize,
    /// Payload files deleted along with their records
    pub payloads_removed: usize,
}

impl Uplink {
    /// Delete terminal records older than the retention window
    ///
    /// Holds the store gate for writing, so producers see
    /// [`crate::Error::StoreUnavailable`] for the duration. Payload files the
    /// pipeline owns (spooled data, outbox files marked for removal) are
    /// deleted once no remaining record points at them.
    pub async fn prune_expired(&self) -> Result<PruneReport> {
        let retention = i64::try_from(self.config.persistence.retention.as_millis())
            .unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention);

        let _gate = self.store_gate.write().await;
        let pruned = self.db.prune(cutoff).await?;

        let mut report = PruneReport::default();
        for artifact in &pruned {
            match artifact.state {
                ArtifactState::Dead => report.dead += 1,
                _ => report.done += 1,
            }

            let Some(path) = &artifact.owned_payload else {
                continue;
            };
            if self.db.payload_referenced(path).await? {
                continue;
            }
            if remove_payload(path).await {
                report.payloads_removed += 1;
            }
        }

        if !pruned.is_empty() {
            tracing::info!(
                done = report.done,
                dead = report.dead,
                payloads_removed = report.payloads_removed,
                "Pruned terminal artifacts"
            );
            self.emit_event(Event::Pruned {
                done: report.done,
                dead: report.dead,
            });
        }

        Ok(report)
    }

    /// Hand in-flight records whose worker stopped heartbeating back to the queue
    pub(crate) async fn sweep_stale_claims(&self) -> Result<()> {
        let timeout = i64::try_from(self.config.scheduler.heartbeat_timeout.as_millis())
            .unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(timeout);

        let reclaimed = self.db.reclaim_stale(cutoff).await?;
        if reclaimed.is_empty() {
            return Ok(());
        }

        let active = self.queue_state.active_uploads.lock().await;
        for id in &reclaimed {
            tracing::warn!(artifact_id = id.0, "Reclaimed artifact with expired heartbeat");
            // A hung local worker must not keep sending after losing its claim
            if let Some(upload) = active.get(id) {
                upload.cancel.cancel();
            }
            self.emit_event(Event::Reclaimed { id: *id });
        }
        drop(active);

        self.queue_state.wake.notify_one();
        Ok(())
    }

    /// Start the retention service that prunes every `prune_interval`
    pub fn start_retention_service(&self) -> tokio::task::JoinHandle<()> {
        let uplink = self.clone();
        let interval = self.config.persistence.prune_interval;

        tokio::spawn(async move {
            let shutdown = uplink.signals.shutdown.clone();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = uplink.prune_expired().await {
                    if e.is_fatal() {
                        uplink.report_fatal(&e);
                        break;
                    }
                    tracing::warn!(error = %e, "Pruning pass failed");
                }
            }

            tracing::debug!("Retention service stopped");
        })
    }
}

async fn remove_payload(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed payload of pruned artifact");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove payload");
            false
        }
    }
}
