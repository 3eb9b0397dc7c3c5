//! Upload pipeline split into focused submodules.
//!
//! The [`Uplink`] struct and its methods are organized by concern:
//! - [`producer`] - Artifact submission
//! - [`scheduler`] - Claiming eligible artifacts into the bounded worker pool
//! - [`upload_task`] - One transfer attempt and its resolution
//! - [`lifecycle`] - Startup recovery and graceful shutdown
//! - [`maintenance`] - Retention pruning and stale-claim sweeping
//! - [`control`] - Statistics, inspection and runtime limits
//! - [`services`] - Background service starters

mod control;
mod lifecycle;
mod maintenance;
mod producer;
mod scheduler;
mod services;
mod upload_task;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use maintenance::PruneReport;
pub use producer::{ArtifactMetadata, Payload};

use crate::config::Config;
use crate::db::{Claim, Database};
use crate::error::{Error, Result, StoreError};
use crate::retry::RetryPolicy;
use crate::speed_limiter::SpeedLimiter;
use crate::transport::{HttpTransport, Transport};
use crate::types::{ArtifactId, Event};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Worker pool and in-flight bookkeeping
#[derive(Clone)]
pub(crate) struct QueueState {
    /// Semaphore bounding concurrent transfers (respects max_concurrent_uploads)
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Running transfers by artifact
    pub(crate) active_uploads: Arc<Mutex<HashMap<ArtifactId, ActiveUpload>>>,
    /// Whether new submissions are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Wakes an idle scheduler after a submission or a resolution
    pub(crate) wake: Arc<Notify>,
}

/// A running transfer as seen by shutdown and the stale sweep
pub(crate) struct ActiveUpload {
    /// Claim the transfer runs under
    pub(crate) claim: Claim,
    /// Cancels this transfer only
    pub(crate) cancel: CancellationToken,
}

/// Process-wide cancellation
#[derive(Clone)]
pub(crate) struct Signals {
    /// Cancelled when graceful shutdown begins; parent of every per-artifact token
    pub(crate) shutdown: CancellationToken,
    /// Cancelled when a store failure makes further progress unsafe
    pub(crate) fatal: CancellationToken,
    /// Message of the first fatal error
    pub(crate) fatal_error: Arc<std::sync::Mutex<Option<String>>>,
}

/// Upload pipeline instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Uplink {
    /// Artifact store (shared by every component)
    /// Public for integration tests to inspect records
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Configuration
    pub(crate) config: Arc<Config>,
    /// Wire implementation used by upload tasks
    pub(crate) transport: Arc<dyn Transport>,
    /// Backoff and abandonment rules
    pub(crate) policy: Arc<RetryPolicy>,
    /// Bandwidth ceiling shared by all transfers
    pub(crate) speed_limiter: SpeedLimiter,
    /// Worker pool state
    pub(crate) queue_state: QueueState,
    /// Held for writing by recovery and pruning; producers only try-read it
    pub(crate) store_gate: Arc<RwLock<()>>,
    /// Shutdown and fatal-error signalling
    pub(crate) signals: Signals,
}

impl Uplink {
    /// Create an uplink that sends artifacts over HTTP
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Opens/creates the store and runs migrations
    /// - Builds the HTTP transport and the shared speed limiter
    /// - Hands records orphaned by a previous run back to the queue
    ///
    /// Background work only begins with [`Uplink::start`] or [`Uplink::start_scheduler`].
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let speed_limiter = SpeedLimiter::new(config.upload.speed_limit_bps);
        let transport = Arc::new(HttpTransport::new(&config.upload, speed_limiter.clone())?);
        Self::assemble(config, transport, speed_limiter).await
    }

    /// Create an uplink around a custom [`Transport`]
    ///
    /// No endpoint is required; the transport owns the wire entirely.
    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let speed_limiter = SpeedLimiter::new(config.upload.speed_limit_bps);
        Self::assemble(config, transport, speed_limiter).await
    }

    async fn assemble(
        config: Config,
        transport: Arc<dyn Transport>,
        speed_limiter: SpeedLimiter,
    ) -> Result<Self> {
        let spool_dir = config.persistence.spool_dir();
        tokio::fs::create_dir_all(&spool_dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create spool directory '{}': {}",
                    spool_dir.display(),
                    e
                ),
            ))
        })?;

        let db = Database::new(&config.persistence.database_path()).await?;

        if db.was_unclean_shutdown().await? {
            tracing::warn!(
                store = %config.persistence.store_dir.display(),
                "Previous run did not shut down cleanly, recovering in-flight artifacts"
            );
        }

        // Mark that we're starting up (for unclean shutdown detection)
        db.set_clean_start().await?;

        // Buffer of 1000 events per subscriber before it starts lagging
        let (event_tx, _rx) = broadcast::channel(1000);

        let queue_state = QueueState {
            concurrent_limit: Arc::new(Semaphore::new(config.upload.max_concurrent_uploads)),
            active_uploads: Arc::new(Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        };

        let signals = Signals {
            shutdown: CancellationToken::new(),
            fatal: CancellationToken::new(),
            fatal_error: Arc::new(std::sync::Mutex::new(None)),
        };

        let uplink = Self {
            db: Arc::new(db),
            event_tx,
            policy: Arc::new(RetryPolicy::from_config(&config.retry)),
            config: Arc::new(config),
            transport,
            speed_limiter,
            queue_state,
            store_gate: Arc::new(RwLock::new(())),
            signals,
        };

        uplink.recover_in_flight().await?;

        Ok(uplink)
    }

    /// Subscribe to pipeline events
    ///
    /// Each subscriber receives all events independently. A subscriber that
    /// falls more than 1000 events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the configuration this instance runs with
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Token cancelled when a fatal store failure stops the pipeline
    pub fn fatal_token(&self) -> CancellationToken {
        self.signals.fatal.clone()
    }

    /// Message of the fatal error that stopped the pipeline, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.signals
            .fatal_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Emit an event to all subscribers
    ///
    /// Dropped silently when nobody is listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Record a store failure that makes further progress unsafe
    ///
    /// Stops the scheduler and every running transfer. The first error wins.
    pub(crate) fn report_fatal(&self, error: &Error) {
        {
            let mut slot = self
                .signals
                .fatal_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(error.to_string());
            }
        }

        tracing::error!(error = %error, code = error.code(), "Fatal store failure, stopping uplink");
        self.signals.fatal.cancel();
        self.signals.shutdown.cancel();
    }

    /// The fatal error as an [`Error`], for callers that must exit non-zero
    pub(crate) fn fatal_as_error(&self) -> Option<Error> {
        self.fatal_error()
            .map(|msg| Error::Store(StoreError::QueryFailed(msg)))
    }
}
