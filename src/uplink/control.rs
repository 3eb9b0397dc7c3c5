//! Statistics, inspection and runtime limits.

use super::Uplink;
use crate::db::Transition;
use crate::error::{Error, Result};
use crate::types::{ArtifactId, ArtifactInfo, ArtifactState, QueueStats};

impl Uplink {
    /// Count artifacts per state
    pub async fn stats(&self) -> Result<QueueStats> {
        self.db.state_counts().await
    }

    /// Look up one artifact
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no record has this id (it may have been pruned).
    pub async fn artifact(&self, id: ArtifactId) -> Result<ArtifactInfo> {
        self.db
            .get_artifact(id)
            .await?
            .map(|a| a.info())
            .ok_or(Error::NotFound(id))
    }

    /// All stored artifacts
    pub async fn artifacts(&self) -> Result<Vec<ArtifactInfo>> {
        Ok(self
            .db
            .list_artifacts()
            .await?
            .iter()
            .map(|a| a.info())
            .collect())
    }

    /// Artifacts currently in `state`
    pub async fn artifacts_in(&self, state: ArtifactState) -> Result<Vec<ArtifactInfo>> {
        Ok(self
            .db
            .list_by_state(state)
            .await?
            .iter()
            .map(|a| a.info())
            .collect())
    }

    /// Dead-lettered artifacts not yet pruned, newest first
    pub async fn dead_letters(&self) -> Result<Vec<ArtifactInfo>> {
        Ok(self
            .db
            .list_dead_letters()
            .await?
            .iter()
            .map(|a| a.info())
            .collect())
    }

    /// Every state change recorded for an artifact, oldest first
    pub async fn history(&self, id: ArtifactId) -> Result<Vec<Transition>> {
        self.db.transitions(id).await
    }

    /// Number of transfers running right now
    pub async fn active_count(&self) -> usize {
        self.queue_state.active_uploads.lock().await.len()
    }

    /// Change the bandwidth ceiling at runtime (None = unlimited)
    pub fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.speed_limiter.set_limit(limit_bps);
        match limit_bps {
            Some(bps) => tracing::info!(limit_bps = bps, "Speed limit updated"),
            None => tracing::info!("Speed limit removed"),
        }
    }

    /// Current bandwidth ceiling
    pub fn speed_limit(&self) -> Option<u64> {
        self.speed_limiter.limit()
    }
}
