//! Transport client: moves one artifact's bytes to the remote endpoint
//!
//! [`Transport`] is the seam between the scheduler and the wire. The upload
//! task builds an [`UploadSession`] for each attempt, hands it to the
//! transport together with a [`ProgressSink`] and a cancellation token, and
//! turns the outcome into a store transition.

use crate::db::Artifact;
use crate::error::TransferError;
use crate::types::{ArtifactId, Priority};
use crate::utils::millis_to_datetime;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod http;

pub use http::HttpTransport;

/// State of one transfer attempt
///
/// Lives only for the attempt. The resume point is persisted through the
/// [`ProgressSink`] after every acknowledged chunk, not by storing the session.
#[derive(Clone, Debug)]
pub struct UploadSession {
    /// Artifact being sent
    pub artifact_id: ArtifactId,
    /// Display name
    pub name: String,
    /// Source identity
    pub source: String,
    /// Payload file
    pub payload_path: PathBuf,
    /// Payload size in bytes
    pub size: u64,
    /// Checksum recorded at submission
    pub checksum: String,
    /// When the artifact was produced
    pub created_at: DateTime<Utc>,
    /// Priority class
    pub priority: Priority,
    /// Bytes the remote side has acknowledged
    pub bytes_transferred: u64,
    /// Transport-level resume token, if a remote session exists
    pub resume_token: Option<String>,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt must be over
    pub deadline: DateTime<Utc>,
}

impl UploadSession {
    /// Start an attempt for a claimed artifact, resuming from its persisted token
    pub fn for_artifact(artifact: &Artifact, timeout: Duration) -> Self {
        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            artifact_id: artifact.id,
            name: artifact.name.clone(),
            source: artifact.source.clone(),
            payload_path: PathBuf::from(&artifact.payload_path),
            size: u64::try_from(artifact.size_bytes).unwrap_or(0),
            checksum: artifact.checksum.clone(),
            created_at: millis_to_datetime(artifact.created_at),
            priority: artifact.priority(),
            bytes_transferred: u64::try_from(artifact.bytes_confirmed).unwrap_or(0),
            resume_token: artifact.resume_token.clone(),
            started_at,
            deadline,
        }
    }

    /// Forget the remote session; the next chunk starts from zero
    pub fn reset(&mut self) {
        self.resume_token = None;
        self.bytes_transferred = 0;
    }
}

/// Successful delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Remote-assigned confirmation identifier, if the endpoint returns one
    pub confirmation_id: Option<String>,
    /// Bytes the remote side holds
    pub bytes: u64,
}

/// Receives the resume point each time the remote side acknowledges bytes
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persist `resume_token` and `bytes_confirmed` so a later attempt can resume
    async fn checkpoint(&self, resume_token: Option<&str>, bytes_confirmed: u64, total: u64);
}

/// Sink that discards progress
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn checkpoint(&self, _resume_token: Option<&str>, _bytes_confirmed: u64, _total: u64) {}
}

/// Moves an artifact's payload to the remote endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one transfer attempt
    ///
    /// Must return [`TransferError::Cancelled`] when `cancel` fires before the
    /// transfer completes, and must never hold the whole payload in memory.
    async fn upload(
        &self,
        session: &mut UploadSession,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Delivery, TransferError>;
}
