//! Upload task: runs one transfer attempt and resolves it into a store transition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::Uplink;
use crate::db::{Artifact, Claim};
use crate::error::{CancelReason, TransferError};
use crate::retry::RetryDecision;
use crate::transport::{Delivery, ProgressSink, Transport, UploadSession};
use crate::types::{ArtifactState, Event};

/// Lower bound on the heartbeat period, for very short test timeouts
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

/// Everything an upload task needs, handed over by the scheduler
pub(crate) struct UploadTaskContext {
    /// The claimed record, as read just before the claim
    pub(crate) artifact: Artifact,
    /// Ownership every store write of this attempt is checked against
    pub(crate) claim: Claim,
    pub(crate) uplink: Uplink,
    pub(crate) transport: Arc<dyn Transport>,
    /// Cancelled on shutdown, or when the claim is lost
    pub(crate) cancel_token: CancellationToken,
}

/// Run one attempt for a claimed artifact
///
/// The attempt ends in exactly one store transition: `done`, `retrying`,
/// `dead`, or (for local cancellation) back to `retrying` without penalty.
pub(crate) async fn run_upload_task(ctx: UploadTaskContext) {
    let id = ctx.artifact.id;
    let uplink = ctx.uplink.clone();

    let outcome = attempt(&ctx).await;
    resolve(&ctx, outcome).await;

    {
        // After a reclaim the entry may already belong to a newer attempt
        let mut active = uplink.queue_state.active_uploads.lock().await;
        if active.get(&id).is_some_and(|upload| upload.claim == ctx.claim) {
            active.remove(&id);
        }
    }
    uplink.queue_state.wake.notify_one();
}

async fn attempt(ctx: &UploadTaskContext) -> Result<Delivery, TransferError> {
    let uplink = &ctx.uplink;
    let artifact = &ctx.artifact;
    let timeout = uplink.config.upload.transfer_timeout;

    let mut session = UploadSession::for_artifact(artifact, timeout);

    tracing::info!(
        artifact_id = artifact.id.0,
        name = %artifact.name,
        attempt = artifact.attempts() + 1,
        resume_from = session.bytes_transferred,
        "Starting upload"
    );
    uplink.emit_event(Event::Uploading {
        id: artifact.id,
        attempt: artifact.attempts(),
        resume_from: session.bytes_transferred,
    });

    let heartbeat = spawn_heartbeat(uplink, ctx.claim);
    let _stop_heartbeat = heartbeat.drop_guard();

    let sink = StoreProgress {
        uplink: uplink.clone(),
        claim: ctx.claim,
        cancel: ctx.cancel_token.clone(),
    };

    let transfer = ctx.transport.upload(&mut session, &sink, &ctx.cancel_token);
    match tokio::time::timeout(timeout, transfer).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                artifact_id = artifact.id.0,
                timeout_secs = timeout.as_secs(),
                "Transfer attempt exceeded its deadline"
            );
            Err(TransferError::Cancelled(CancelReason::Deadline))
        }
    }
}

/// Keep `heartbeat_at` fresh while the attempt runs
///
/// Returns the token that stops the ticker.
fn spawn_heartbeat(uplink: &Uplink, claim: Claim) -> CancellationToken {
    let stop = CancellationToken::new();
    let period = (uplink.config.scheduler.heartbeat_timeout / 3).max(MIN_HEARTBEAT_PERIOD);
    let db = Arc::clone(&uplink.db);
    let token = stop.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // interval fires immediately; the claim itself set the first heartbeat
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match db.heartbeat(claim).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => tracing::warn!(artifact_id = claim.id.0, error = %e, "Heartbeat failed"),
                },
            }
        }
    });

    stop
}

async fn resolve(ctx: &UploadTaskContext, outcome: Result<Delivery, TransferError>) {
    let uplink = &ctx.uplink;
    let artifact = &ctx.artifact;
    let id = artifact.id;

    let claim = ctx.claim;

    let result = match outcome {
        Ok(delivery) => deliver(uplink, artifact, claim, delivery).await,
        Err(error) => match uplink.policy.decide(&error, artifact.attempts()) {
            RetryDecision::Retry { delay } => retry(uplink, artifact, claim, &error, delay).await,
            RetryDecision::Abandon => abandon(uplink, artifact, claim, &error).await,
            RetryDecision::Requeue => requeue(uplink, claim, &error).await,
        },
    };

    match result {
        Ok(()) => {}
        Err(e) if e.is_fatal() => uplink.report_fatal(&e),
        Err(e) => {
            // Reclaimed by the stale sweep, possibly claimed again by a newer attempt
            tracing::warn!(artifact_id = id.0, error = %e, "Discarding outcome of superseded attempt");
        }
    }
}

async fn deliver(
    uplink: &Uplink,
    artifact: &Artifact,
    claim: Claim,
    delivery: Delivery,
) -> crate::Result<()> {
    uplink
        .db
        .mark_complete(claim, delivery.confirmation_id.as_deref())
        .await?;

    tracing::info!(
        artifact_id = artifact.id.0,
        name = %artifact.name,
        bytes = delivery.bytes,
        confirmation_id = delivery.confirmation_id.as_deref().unwrap_or("-"),
        "Artifact delivered"
    );
    uplink.emit_event(Event::Delivered {
        id: artifact.id,
        confirmation_id: delivery.confirmation_id,
    });
    Ok(())
}

async fn retry(
    uplink: &Uplink,
    artifact: &Artifact,
    claim: Claim,
    error: &TransferError,
    delay: Duration,
) -> crate::Result<()> {
    let message = error.to_string();
    let attempts = artifact.attempts().saturating_add(1);
    let state = uplink
        .db
        .mark_failed(claim, &message, delay, uplink.policy.max_attempts())
        .await?;

    if state == ArtifactState::Dead {
        log_dead_letter(artifact, attempts, &message);
        uplink.emit_event(Event::DeadLettered {
            id: artifact.id,
            attempts,
            error: message,
        });
        return Ok(());
    }

    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    tracing::warn!(
        artifact_id = artifact.id.0,
        attempts,
        delay_ms,
        error = %message,
        "Upload failed, retry scheduled"
    );
    uplink.emit_event(Event::RetryScheduled {
        id: artifact.id,
        attempts,
        delay_ms,
        error: message,
    });
    Ok(())
}

async fn abandon(
    uplink: &Uplink,
    artifact: &Artifact,
    claim: Claim,
    error: &TransferError,
) -> crate::Result<()> {
    let message = error.to_string();
    uplink.db.mark_dead(claim, &message).await?;

    let attempts = artifact.attempts().saturating_add(1);
    log_dead_letter(artifact, attempts, &message);
    uplink.emit_event(Event::DeadLettered {
        id: artifact.id,
        attempts,
        error: message,
    });
    Ok(())
}

async fn requeue(uplink: &Uplink, claim: Claim, error: &TransferError) -> crate::Result<()> {
    let id = claim.id;
    let reason = error.to_string();
    uplink.db.requeue(claim, &reason).await?;

    tracing::info!(artifact_id = id.0, reason = %reason, "Upload interrupted, artifact requeued");
    uplink.emit_event(Event::Requeued { id, reason });
    Ok(())
}

fn log_dead_letter(artifact: &Artifact, attempts: u32, error: &str) {
    tracing::error!(
        artifact_id = artifact.id.0,
        name = %artifact.name,
        attempts,
        last_error = %error,
        checksum = %artifact.checksum,
        "Artifact dead-lettered"
    );
}

/// Persists each acknowledged resume point through the store
struct StoreProgress {
    uplink: Uplink,
    claim: Claim,
    cancel: CancellationToken,
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn checkpoint(&self, resume_token: Option<&str>, bytes_confirmed: u64, total: u64) {
        let id = self.claim.id;
        match self
            .uplink
            .db
            .record_progress(self.claim, resume_token, bytes_confirmed)
            .await
        {
            Ok(true) => {
                self.uplink.emit_event(Event::Progress {
                    id,
                    bytes: bytes_confirmed,
                    total,
                });
            }
            Ok(false) => {
                tracing::warn!(
                    artifact_id = id.0,
                    "Claim no longer held, abandoning this attempt"
                );
                self.cancel.cancel();
            }
            Err(e) => {
                if e.is_fatal() {
                    self.uplink.report_fatal(&e);
                } else {
                    tracing::warn!(artifact_id = id.0, error = %e, "Failed to record progress");
                }
                self.cancel.cancel();
            }
        }
    }
}
