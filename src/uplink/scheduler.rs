//! Scheduler: moves eligible artifacts into the bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use super::upload_task::UploadTaskContext;
use super::{ActiveUpload, Uplink};
use crate::error::{Error, Result};
use crate::utils::now_millis;

/// Back-off after a non-fatal store hiccup before peeking again
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

impl Uplink {
    /// Start the scheduler task
    ///
    /// This method spawns a background task that continuously:
    /// 1. Acquires a permit from the concurrency limiter
    /// 2. Peeks the highest-priority eligible artifact (oldest first within a class)
    /// 3. Claims it atomically and spawns an upload task holding the permit
    /// 4. Repeats until shutdown
    ///
    /// The permit is taken before peeking, so a slot that frees up always goes
    /// to whatever is most urgent at that moment rather than to an artifact
    /// picked while every slot was busy.
    pub fn start_scheduler(&self) -> tokio::task::JoinHandle<()> {
        let uplink = self.clone();
        tokio::spawn(async move {
            uplink.run_scheduler().await;
        })
    }

    async fn run_scheduler(&self) {
        let shutdown = self.signals.shutdown.clone();
        let poll_interval = self.config.scheduler.poll_interval;
        let sweep_interval = (self.config.scheduler.heartbeat_timeout / 2).max(poll_interval);
        let mut last_sweep = Instant::now();

        tracing::info!(
            max_concurrent = self.config.upload.max_concurrent_uploads,
            "Scheduler started"
        );

        loop {
            if last_sweep.elapsed() >= sweep_interval {
                last_sweep = Instant::now();
                if let Err(e) = self.sweep_stale_claims().await {
                    if e.is_fatal() {
                        self.report_fatal(&e);
                        break;
                    }
                    tracing::warn!(error = %e, "Stale claim sweep failed");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.queue_state.concurrent_limit.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match self.dispatch_next(permit).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    self.report_fatal(&e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Scheduler could not dispatch, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            }

            // Nothing eligible: sleep until woken, the next backoff expires, or the poll tick
            let wait = self.idle_wait(poll_interval).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue_state.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Claim the next eligible artifact and spawn its upload task
    ///
    /// Returns false when nothing is eligible; the permit is released then.
    async fn dispatch_next(&self, permit: OwnedSemaphorePermit) -> Result<bool> {
        let Some(artifact) = self.db.next_eligible(now_millis()).await? else {
            return Ok(false);
        };
        let id = artifact.id;

        let claim = match self.db.claim(id).await {
            Ok(claim) => claim,
            Err(Error::AlreadyClaimed(_)) | Err(Error::NotFound(_)) => {
                tracing::debug!(artifact_id = id.0, "Lost claim race, peeking again");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        // Child of the shutdown token, so shutdown and fatal errors reach every transfer
        let cancel_token = self.signals.shutdown.child_token();
        {
            let mut active = self.queue_state.active_uploads.lock().await;
            active.insert(
                id,
                ActiveUpload {
                    claim,
                    cancel: cancel_token.clone(),
                },
            );
        }

        tracing::debug!(
            artifact_id = id.0,
            name = %artifact.name,
            priority = ?artifact.priority(),
            attempts = artifact.attempts,
            claim_seq = claim.seq,
            "Claimed artifact"
        );

        let ctx = UploadTaskContext {
            artifact,
            claim,
            uplink: self.clone(),
            transport: Arc::clone(&self.transport),
            cancel_token,
        };

        tokio::spawn(async move {
            let _permit = permit;
            super::upload_task::run_upload_task(ctx).await;
        });

        Ok(true)
    }

    /// How long an idle scheduler may sleep before something could become eligible
    async fn idle_wait(&self, poll_interval: Duration) -> Duration {
        match self.db.next_wake_time().await {
            Ok(Some(at)) => {
                let until = u64::try_from(at.saturating_sub(now_millis())).unwrap_or(0);
                Duration::from_millis(until).min(poll_interval)
            }
            Ok(None) => poll_interval,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read next wake time");
                poll_interval
            }
        }
    }
}
