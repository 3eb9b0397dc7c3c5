//! Error types for edge-uplink
//!
//! This module provides the error taxonomy of the upload pipeline:
//! - [`Error`] - top-level error returned by the library API
//! - [`StoreError`] - failures of the durable artifact store
//! - [`TransferError`] - classified outcome of a failed transfer attempt
//!
//! Transfer failures never escape the retry policy as process-fatal errors;
//! only store and local-storage failures are fatal (see [`Error::is_fatal`]).

use crate::types::{ArtifactId, ArtifactState};
use thiserror::Error;

/// Result type alias for edge-uplink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for edge-uplink
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "UPLINK_ENDPOINT")
        key: Option<String>,
    },

    /// Artifact store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// SQLx database error
    #[error("store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error outside of a transfer attempt
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transfer attempt failed
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// An artifact with the same checksum and source identity is already recorded
    #[error("duplicate artifact: already recorded as {existing} (checksum {checksum})")]
    DuplicateArtifact {
        /// Identifier of the artifact already in the store
        existing: ArtifactId,
        /// Checksum shared by both submissions
        checksum: String,
    },

    /// Claim lost: the artifact is no longer pending or retrying
    #[error("artifact {0} is already claimed")]
    AlreadyClaimed(ArtifactId),

    /// Required producer metadata is missing or malformed
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The store cannot accept writes right now (pruning, recovery, write failure)
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Artifact not found
    #[error("artifact not found: {0}")]
    NotFound(ArtifactId),

    /// Shutdown in progress - not accepting new artifacts
    #[error("shutdown in progress: not accepting new artifacts")]
    ShuttingDown,

    /// In-flight transfers did not finish within the shutdown grace period
    #[error("shutdown grace period elapsed with {in_flight} transfer(s) still running")]
    ShutdownTimedOut {
        /// Number of transfers still running when the grace period ran out
        in_flight: usize,
    },

    /// Outbox watching error
    #[error("outbox watch error: {0}")]
    Watch(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error invalidates the store's guarantees and must stop the process
    ///
    /// Only store corruption or unrecoverable local-storage failures qualify.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Store(StoreError::InvalidTransition { .. }) => false,
            Error::Store(StoreError::NotFound(_)) => false,
            Error::Store(StoreError::ClaimSuperseded(_)) => false,
            Error::Store(_) | Error::Sqlx(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::StorageFull
                    | std::io::ErrorKind::ReadOnlyFilesystem
                    | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    /// Machine-readable error code, used as a structured log field
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Store(_) | Error::Sqlx(_) => "store_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Transfer(_) => "transfer_error",
            Error::DuplicateArtifact { .. } => "duplicate_artifact",
            Error::AlreadyClaimed(_) => "already_claimed",
            Error::InvalidMetadata(_) => "invalid_metadata",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::ShutdownTimedOut { .. } => "shutdown_timed_out",
            Error::Watch(_) => "watch_error",
            Error::Other(_) => "other",
        }
    }
}

/// Artifact store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open the store
    #[error("failed to open store: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// A state change was requested from a state that does not allow it
    #[error("artifact {id} cannot move to {to:?}: current state is {from:?}")]
    InvalidTransition {
        /// The artifact the transition was requested for
        id: ArtifactId,
        /// State the record was actually in
        from: ArtifactState,
        /// State the caller asked for
        to: ArtifactState,
    },

    /// The record was reclaimed and claimed again since this claim was taken
    #[error("claim on artifact {0} was superseded by a newer attempt")]
    ClaimSuperseded(ArtifactId),
}

/// Why a transfer attempt was cut short locally
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Shutdown was requested
    Shutdown,
    /// The per-attempt deadline elapsed
    Deadline,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "shutdown requested"),
            CancelReason::Deadline => write!(f, "deadline exceeded"),
        }
    }
}

/// Classified failure of one transfer attempt
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Network error, timeout or 5xx-equivalent response
    #[error("transient failure: {0}")]
    Transient(String),

    /// Payload or request rejected (4xx-equivalent)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The payload no longer matches the checksum recorded at submission
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum recorded when the artifact was created
        expected: String,
        /// Checksum computed locally or confirmed by the remote endpoint
        actual: String,
    },

    /// The remote side no longer knows the resume token; the next attempt restarts from zero
    #[error("upload session expired: {0}")]
    SessionExpired(String),

    /// The attempt was interrupted locally
    #[error("transfer cancelled: {0}")]
    Cancelled(CancelReason),
}
