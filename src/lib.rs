//! # edge-uplink
//!
//! Reliable artifact uplink for edge devices on intermittent links.
//!
//! Producers hand over finished artifacts (captures, readings, logs); the
//! uplink records each one durably in a local SQLite store and delivers it to
//! a remote collection endpoint, surviving power loss, process restarts and
//! network outages without losing or silently duplicating anything.
//!
//! ## Design
//!
//! - **Store first** - an artifact is only acknowledged once its record is committed
//! - **Persisted state machine** - `pending -> in_flight -> {done, retrying, dead}`;
//!   retries are scheduled state, never nested loops
//! - **Bounded parallelism** - a semaphore sized by `max_concurrent_uploads`
//!   plus an atomic claim per artifact
//! - **Resumable transfers** - the remote offset is checkpointed after every chunk
//! - **Event-driven** - consumers subscribe to [`Event`]s instead of polling
//!
//! ## Quick Start
//!
//! ```no_run
//! use edge_uplink::{ArtifactMetadata, Config, Payload, Priority, Uplink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.upload.endpoint = Some("https://collector.example.com/v1/".parse()?);
//!
//!     let uplink = Uplink::new(config).await?;
//!     uplink.start().await?;
//!
//!     // Subscribe to events
//!     let mut events = uplink.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     uplink
//!         .submit(
//!             Payload::File("/var/captures/2024-05-01T12:00:00+0000.jpg".into()),
//!             ArtifactMetadata::named("2024-05-01T12:00:00+0000.jpg")
//!                 .with_priority(Priority::High),
//!         )
//!         .await?;
//!
//!     uplink.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Durable artifact store
pub mod db;
/// Error types
pub mod error;
/// Outbox directory watching for automatic submission
pub mod outbox;
/// Failure classification and backoff policy
pub mod retry;
/// Bandwidth ceiling with token bucket
pub mod speed_limiter;
/// Wire transport to the remote endpoint
pub mod transport;
/// Core types and events
pub mod types;
/// Upload pipeline (decomposed into focused submodules)
pub mod uplink;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, CredentialRef, OutboxConfig};
pub use db::Database;
pub use error::{Error, Result, StoreError, TransferError};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{Delivery, HttpTransport, ProgressSink, Transport, UploadSession};
pub use types::{ArtifactId, ArtifactInfo, ArtifactState, Event, Priority, QueueStats};
pub use uplink::{ArtifactMetadata, Payload, PruneReport, Uplink};

/// Helper function to run the uplink until a termination signal or a fatal failure.
///
/// Either way the uplink's `shutdown()` runs before this returns.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Errors
///
/// Returns the fatal store error that stopped the pipeline, or
/// [`Error::ShutdownTimedOut`] when transfers outlived the grace period.
///
/// # Example
///
/// ```no_run
/// use edge_uplink::{Uplink, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let uplink = Uplink::new(Config::from_env()?).await?;
///     uplink.start().await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(uplink).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(uplink: Uplink) -> Result<()> {
    let fatal = uplink.fatal_token();

    tokio::select! {
        _ = wait_for_signal() => {}
        _ = fatal.cancelled() => {
            tracing::error!("Stopping after fatal store failure");
        }
    }

    let shutdown = uplink.shutdown().await;
    match uplink.fatal_as_error() {
        Some(fatal) => Err(fatal),
        None => shutdown,
    }
}

/// Resolve once SIGTERM or SIGINT arrives
///
/// A handler that cannot be registered (some containers and test harnesses
/// forbid it) is skipped; with neither available, `ctrl_c` is the last resort.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    async fn recv_or_pending(sig: &mut Option<Signal>) {
        match sig {
            Some(sig) => {
                sig.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let mut sigterm = signal(SignalKind::terminate())
        .inspect_err(|e| tracing::warn!(error = %e, "SIGTERM handler unavailable"))
        .ok();
    let mut sigint = signal(SignalKind::interrupt())
        .inspect_err(|e| tracing::warn!(error = %e, "SIGINT handler unavailable"))
        .ok();

    if sigterm.is_none() && sigint.is_none() {
        tracing::error!("No signal handlers registered, falling back to ctrl_c");
        tokio::signal::ctrl_c().await.ok();
        return;
    }

    tokio::select! {
        _ = recv_or_pending(&mut sigterm) => tracing::info!("SIGTERM received, stopping uplink"),
        _ = recv_or_pending(&mut sigint) => tracing::info!("SIGINT received, stopping uplink"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl+C received, stopping uplink");
}
