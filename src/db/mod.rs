//! Artifact store for edge-uplink
//!
//! SQLite persistence for artifacts, their state transitions and runtime state.
//! The store is the single source of truth for delivery state; every state
//! change is a guarded `UPDATE` whose `WHERE` clause names the expected source
//! state, and is logged to `transitions` in the same transaction.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`artifacts`] - Enqueue, claim, resolution and inspection of artifacts
//! - [`state`] - Runtime state (shutdown tracking)

use crate::types::{ArtifactId, ArtifactInfo, ArtifactState, Priority};
use crate::utils::millis_to_datetime;
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod artifacts;
mod migrations;
mod state;

/// New artifact to be inserted into the store
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Display name
    pub name: String,
    /// Source identity (canonical path or caller-supplied identity)
    pub source: String,
    /// Where the payload bytes live
    pub payload_path: PathBuf,
    /// Whether the payload file is removed when the record is pruned
    pub owns_payload: bool,
    /// Payload size in bytes
    pub size_bytes: i64,
    /// Lowercase hex SHA-256 of the payload
    pub checksum: String,
    /// Priority class
    pub priority: Priority,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

/// Artifact record from the store
#[derive(Debug, Clone, FromRow)]
pub struct Artifact {
    /// Unique database ID
    pub id: ArtifactId,
    /// Display name
    pub name: String,
    /// Source identity
    pub source: String,
    /// Payload location
    pub payload_path: String,
    /// Whether pruning removes the payload file
    pub owns_payload: bool,
    /// Payload size in bytes
    pub size_bytes: i64,
    /// Lowercase hex SHA-256 recorded at submission
    pub checksum: String,
    /// Priority (-1 low, 0 normal, 1 high)
    pub priority: i32,
    /// State code (see [`ArtifactState::from_i32`])
    pub state: i32,
    /// Failed attempts so far
    pub attempts: i64,
    /// Last error message
    pub last_error: Option<String>,
    /// Earliest time of the next attempt (Unix milliseconds)
    pub next_eligible_at: i64,
    /// Transport-level resume token of the current session
    pub resume_token: Option<String>,
    /// Bytes the remote endpoint has confirmed for the current session
    pub bytes_confirmed: i64,
    /// Remote-assigned confirmation identifier
    pub confirmation_id: Option<String>,
    /// Last heartbeat of the owning worker (Unix milliseconds)
    pub heartbeat_at: Option<i64>,
    /// Bumped by every claim; identifies the current owner of an in-flight record
    pub claim_seq: i64,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
    /// Last modification (Unix milliseconds)
    pub updated_at: i64,
    /// When a terminal state was reached (Unix milliseconds)
    pub finished_at: Option<i64>,
}

impl Artifact {
    /// Decoded state; unknown codes are reported as `Dead` so they are never scheduled
    pub fn state(&self) -> ArtifactState {
        ArtifactState::from_i32(self.state).unwrap_or(ArtifactState::Dead)
    }

    /// Decoded priority
    pub fn priority(&self) -> Priority {
        Priority::from_i32(self.priority)
    }

    /// Failed attempts as an unsigned count
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0)
    }

    /// Public view of this record
    pub fn info(&self) -> ArtifactInfo {
        ArtifactInfo {
            id: self.id,
            name: self.name.clone(),
            source: self.source.clone(),
            payload_path: PathBuf::from(&self.payload_path),
            size_bytes: u64::try_from(self.size_bytes).unwrap_or(0),
            checksum: self.checksum.clone(),
            priority: self.priority(),
            state: self.state(),
            attempts: self.attempts(),
            last_error: self.last_error.clone(),
            bytes_confirmed: u64::try_from(self.bytes_confirmed).unwrap_or(0),
            confirmation_id: self.confirmation_id.clone(),
            created_at: millis_to_datetime(self.created_at),
            next_eligible_at: millis_to_datetime(self.next_eligible_at),
            finished_at: self.finished_at.map(millis_to_datetime),
        }
    }
}

/// Ownership of an in-flight record, returned by [`Database::claim`]
///
/// Progress and resolution writes only apply while the record is still held
/// under the same claim. Once the stale sweep reclaims it and another worker
/// claims it again, writes from the earlier holder match nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    /// Claimed artifact
    pub id: ArtifactId,
    /// Claim sequence number at the time of the claim
    pub seq: i64,
}

/// One row of the state transition log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the change (`None` for the initial insert)
    pub from: Option<ArtifactState>,
    /// State after the change
    pub to: ArtifactState,
    /// When it happened (Unix milliseconds)
    pub at: i64,
}

/// Summary of a record removed by pruning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedArtifact {
    /// Removed artifact ID
    pub id: ArtifactId,
    /// Display name
    pub name: String,
    /// Terminal state at removal
    pub state: ArtifactState,
    /// Attempts consumed
    pub attempts: u32,
    /// Last error (dead letters)
    pub last_error: Option<String>,
    /// Payload checksum
    pub checksum: String,
    /// Payload file, when the record owned it
    pub owned_payload: Option<PathBuf>,
}

/// Artifact store handle
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
