//! Core types for edge-uplink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for an artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub i64);

impl ArtifactId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ArtifactId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<ArtifactId> for i64 {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Stored as a plain INTEGER column
impl sqlx::Type<sqlx::Sqlite> for ArtifactId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ArtifactId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ArtifactId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Delivery state of an artifact
///
/// ```text
/// pending -> in_flight -> { done | retrying | dead }
/// retrying -> in_flight
/// ```
///
/// `done` and `dead` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    /// Recorded, never attempted
    Pending,
    /// Claimed by a worker, transfer running
    InFlight,
    /// Waiting for its backoff to elapse before the next attempt
    Retrying,
    /// Delivered and confirmed
    Done,
    /// Dead-lettered, will not be retried
    Dead,
}

impl ArtifactState {
    /// Convert integer state code to ArtifactState
    ///
    /// Returns None for codes this version does not know about.
    pub fn from_i32(state: i32) -> Option<Self> {
        match state {
            0 => Some(ArtifactState::Pending),
            1 => Some(ArtifactState::InFlight),
            2 => Some(ArtifactState::Retrying),
            3 => Some(ArtifactState::Done),
            4 => Some(ArtifactState::Dead),
            _ => None,
        }
    }

    /// Convert ArtifactState to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            ArtifactState::Pending => 0,
            ArtifactState::InFlight => 1,
            ArtifactState::Retrying => 2,
            ArtifactState::Done => 3,
            ArtifactState::Dead => 4,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactState::Done | ArtifactState::Dead)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Retrying, InFlight)
                | (InFlight, Done)
                | (InFlight, Retrying)
                | (InFlight, Dead)
        )
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactState::Pending => "pending",
            ArtifactState::InFlight => "in_flight",
            ArtifactState::Retrying => "retrying",
            ArtifactState::Done => "done",
            ArtifactState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Upload priority class
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
}

impl Priority {
    /// Convert integer priority code to Priority
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            i32::MIN..=-1 => Priority::Low,
            0 => Priority::Normal,
            _ => Priority::High,
        }
    }

    /// Convert Priority to its integer code
    pub fn to_i32(&self) -> i32 {
        *self as i32
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Event emitted during the artifact lifecycle
///
/// This is the status/acknowledgement channel back to producers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Artifact durably recorded
    Queued {
        /// Artifact ID
        id: ArtifactId,
        /// Artifact name
        name: String,
        /// Priority class
        priority: Priority,
    },

    /// A transfer attempt started
    Uploading {
        /// Artifact ID
        id: ArtifactId,
        /// Number of failed attempts before this one
        attempt: u32,
        /// Byte offset the attempt resumes from (0 for a fresh transfer)
        resume_from: u64,
    },

    /// Bytes acknowledged by the remote endpoint
    Progress {
        /// Artifact ID
        id: ArtifactId,
        /// Bytes confirmed so far
        bytes: u64,
        /// Total payload size
        total: u64,
    },

    /// Delivery confirmed
    Delivered {
        /// Artifact ID
        id: ArtifactId,
        /// Remote-assigned confirmation identifier, if any
        confirmation_id: Option<String>,
    },

    /// Transient failure, retry scheduled
    RetryScheduled {
        /// Artifact ID
        id: ArtifactId,
        /// Failed attempts so far
        attempts: u32,
        /// Backoff before the next attempt, in milliseconds
        delay_ms: u64,
        /// Error message
        error: String,
    },

    /// Attempt interrupted locally, artifact returned to the queue without penalty
    Requeued {
        /// Artifact ID
        id: ArtifactId,
        /// Why it was requeued
        reason: String,
    },

    /// Artifact moved to the dead-letter state
    DeadLettered {
        /// Artifact ID
        id: ArtifactId,
        /// Attempts consumed
        attempts: u32,
        /// Last error
        error: String,
    },

    /// Orphaned in-flight record handed back to the queue
    Reclaimed {
        /// Artifact ID
        id: ArtifactId,
    },

    /// Terminal records removed after the retention window
    Pruned {
        /// Delivered records removed
        done: usize,
        /// Dead-lettered records removed
        dead: usize,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Public view of a stored artifact
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Artifact ID
    pub id: ArtifactId,
    /// Display name
    pub name: String,
    /// Source identity
    pub source: String,
    /// Payload location on disk
    pub payload_path: PathBuf,
    /// Payload size in bytes
    pub size_bytes: u64,
    /// Hex SHA-256 checksum recorded at submission
    pub checksum: String,
    /// Priority class
    pub priority: Priority,
    /// Current state
    pub state: ArtifactState,
    /// Failed attempts so far
    pub attempts: u32,
    /// Last error message
    pub last_error: Option<String>,
    /// Bytes confirmed by the remote endpoint for the current session
    pub bytes_confirmed: u64,
    /// Remote-assigned confirmation identifier (delivered artifacts)
    pub confirmation_id: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Earliest time the next attempt may start
    pub next_eligible_at: DateTime<Utc>,
    /// When the artifact reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// Queue statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Artifacts never attempted
    pub pending: u64,
    /// Artifacts currently being transferred
    pub in_flight: u64,
    /// Artifacts waiting for their backoff
    pub retrying: u64,
    /// Delivered artifacts still within the retention window
    pub done: u64,
    /// Dead-lettered artifacts still within the retention window
    pub dead: u64,
}

impl QueueStats {
    /// Artifacts that still need delivery
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight + self.retrying
    }
}
