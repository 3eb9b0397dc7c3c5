//! Producer interface: durable submission of new artifacts.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use super::Uplink;
use crate::db::NewArtifact;
use crate::error::{Error, Result};
use crate::types::{ArtifactId, Event, Priority};
use crate::utils::{sha256_bytes, sha256_file, write_durable};

/// Payload handed over by a producer
#[derive(Clone, Debug)]
pub enum Payload {
    /// A file that already exists on local storage
    ///
    /// The file is referenced in place and must stay readable until delivery.
    File(PathBuf),
    /// In-memory data, spooled to the store directory before submission returns
    Bytes(Vec<u8>),
}

/// Producer-supplied description of an artifact
#[derive(Clone, Debug, Default)]
pub struct ArtifactMetadata {
    /// Display name (required)
    pub name: String,
    /// Source identity used for duplicate detection
    ///
    /// Defaults to the canonical payload path for file payloads; required for
    /// in-memory payloads.
    pub source: Option<String>,
    /// Priority class
    pub priority: Priority,
    /// When the artifact was produced (defaults to submission time)
    pub created_at: Option<DateTime<Utc>>,
    /// Delete the payload file once the record has been pruned
    pub remove_payload_when_pruned: bool,
}

impl ArtifactMetadata {
    /// Metadata with just a name, everything else defaulted
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the source identity
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

impl Uplink {
    /// Durably record a new artifact for upload
    ///
    /// Returns once the record (and, for [`Payload::Bytes`], the spooled
    /// payload) is committed to disk, then wakes the scheduler.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once shutdown has begun
    /// - [`Error::StoreUnavailable`] while recovery or pruning holds the store,
    ///   or when the write itself fails
    /// - [`Error::InvalidMetadata`] for a blank name, a missing source on
    ///   in-memory data, or a payload path that is not a regular file
    /// - [`Error::DuplicateArtifact`] when the same checksum and source are
    ///   already recorded
    pub async fn submit(&self, payload: Payload, metadata: ArtifactMetadata) -> Result<ArtifactId> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let name = metadata.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidMetadata("artifact name is required".to_string()));
        }
        if let Some(source) = &metadata.source
            && source.trim().is_empty()
        {
            return Err(Error::InvalidMetadata(
                "source identity must not be blank".to_string(),
            ));
        }

        let _gate = self.store_gate.try_read().map_err(|_| {
            Error::StoreUnavailable("store is busy with recovery or pruning".to_string())
        })?;

        let created_at = metadata
            .created_at
            .unwrap_or_else(Utc::now)
            .timestamp_millis();

        let (record, spooled) = match payload {
            Payload::File(path) => {
                let record = self.describe_file(&path, name, &metadata, created_at).await?;
                (record, None)
            }
            Payload::Bytes(data) => {
                let Some(source) = metadata.source.clone() else {
                    return Err(Error::InvalidMetadata(
                        "in-memory payloads need a source identity".to_string(),
                    ));
                };
                let (record, created) = self
                    .spool_bytes(&data, name, source, metadata.priority, created_at)
                    .await?;
                let spooled = created.then(|| record.payload_path.clone());
                (record, spooled)
            }
        };

        let id = match self.db.enqueue(&record).await {
            Ok(id) => id,
            Err(e) => {
                if let Some(path) = spooled
                    && !matches!(e, Error::DuplicateArtifact { .. })
                {
                    discard_spooled(&path).await;
                }
                return Err(match e {
                    dup @ Error::DuplicateArtifact { .. } => dup,
                    other => Error::StoreUnavailable(other.to_string()),
                });
            }
        };

        tracing::info!(
            artifact_id = id.0,
            name = %record.name,
            source = %record.source,
            size = record.size_bytes,
            priority = ?record.priority,
            "Artifact queued"
        );
        self.emit_event(Event::Queued {
            id,
            name: record.name,
            priority: record.priority,
        });
        self.queue_state.wake.notify_one();

        Ok(id)
    }

    /// Hash a payload file in place and build its record
    async fn describe_file(
        &self,
        path: &Path,
        name: &str,
        metadata: &ArtifactMetadata,
        created_at: i64,
    ) -> Result<NewArtifact> {
        let file_meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::InvalidMetadata(format!(
                    "payload file '{}' does not exist",
                    path.display()
                )));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if !file_meta.is_file() {
            return Err(Error::InvalidMetadata(format!(
                "payload '{}' is not a regular file",
                path.display()
            )));
        }

        let canonical = tokio::fs::canonicalize(path).await?;
        let (checksum, size) = sha256_file(&canonical).await?;
        let source = metadata
            .source
            .clone()
            .unwrap_or_else(|| canonical.display().to_string());

        Ok(NewArtifact {
            name: name.to_string(),
            source,
            payload_path: canonical,
            owns_payload: metadata.remove_payload_when_pruned,
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            checksum,
            priority: metadata.priority,
            created_at,
        })
    }

    /// Write in-memory data to the spool and build its record
    ///
    /// Spool files are content-addressed, so identical data shares one file.
    /// The flag is true when this call created the file.
    async fn spool_bytes(
        &self,
        data: &[u8],
        name: &str,
        source: String,
        priority: Priority,
        created_at: i64,
    ) -> Result<(NewArtifact, bool)> {
        let checksum = sha256_bytes(data);
        let path = self
            .config
            .persistence
            .spool_dir()
            .join(format!("{}.bin", checksum));

        let created = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            false
        } else {
            write_durable(&path, data).await.map_err(|e| {
                Error::StoreUnavailable(format!(
                    "failed to spool payload to '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            true
        };

        let record = NewArtifact {
            name: name.to_string(),
            source,
            payload_path: path,
            owns_payload: true,
            size_bytes: i64::try_from(data.len()).unwrap_or(i64::MAX),
            checksum,
            priority,
            created_at,
        };
        Ok((record, created))
    }
}

async fn discard_spooled(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove orphaned spool file");
    }
}
