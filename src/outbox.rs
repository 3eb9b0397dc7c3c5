//! Outbox watching for automatic artifact submission
//!
//! Producers that cannot link against the library drop finished files into
//! an outbox directory. The watcher:
//! - Scans the directory at startup for files dropped while the daemon was down
//! - Waits until a file has been quiet for `settle_delay` before submitting it
//! - Filters by extension and skips hidden files (partial writes such as `.name.partial`)
//! - Uses the file's modification time as the artifact's creation time
//!
//! Only the directory itself is watched, not its subdirectories. Each file is
//! submitted with its canonical path as source identity, so a file seen twice
//! is rejected as a duplicate by the store.
//!
//! # Example
//!
//! ```no_run
//! use edge_uplink::{Uplink, config::{Config, OutboxConfig}};
//! use edge_uplink::outbox::OutboxWatcher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let uplink = Uplink::new(Config::default()).await?;
//!
//! let mut watcher = OutboxWatcher::new(uplink, OutboxConfig::new("/var/spool/captures"))?;
//! watcher.start()?;
//! watcher.scan_existing().await;
//!
//! // Run the watcher (returns when the uplink shuts down)
//! watcher.run().await;
//! # Ok(())
//! # }
//! ```

use crate::Uplink;
use crate::config::OutboxConfig;
use crate::error::{Error, Result};
use crate::uplink::{ArtifactMetadata, Payload};
use crate::utils::has_allowed_extension;
use chrono::{DateTime, Utc};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Watches the outbox directory and submits files that appear in it
pub struct OutboxWatcher {
    /// Filesystem watcher instance
    watcher: RecommendedWatcher,

    /// Channel for receiving filesystem events
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,

    /// Pipeline the files are submitted to
    uplink: Uplink,

    /// Outbox settings
    config: OutboxConfig,

    /// Files waiting to settle, with the time they become eligible
    settling: HashMap<PathBuf, Instant>,
}

impl OutboxWatcher {
    /// Create a new outbox watcher
    ///
    /// # Errors
    /// Returns error if the filesystem watcher cannot be initialized
    pub fn new(uplink: Uplink, config: OutboxConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.send(res) {
                    error!("Failed to send filesystem event: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        Ok(Self {
            watcher,
            rx,
            uplink,
            config,
            settling: HashMap::new(),
        })
    }

    /// Start watching the outbox directory, creating it if needed
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or watched
    pub fn start(&mut self) -> Result<()> {
        if !self.config.path.exists() {
            std::fs::create_dir_all(&self.config.path)
                .map_err(|e| Error::Watch(format!("Failed to create outbox directory: {}", e)))?;
            info!("Created outbox directory: {}", self.config.path.display());
        }

        self.watcher
            .watch(&self.config.path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(format!("Failed to watch outbox: {}", e)))?;

        info!(
            path = %self.config.path.display(),
            priority = ?self.config.priority,
            extensions = ?self.config.extensions,
            "Watching outbox"
        );

        Ok(())
    }

    /// Submit every matching file already in the outbox, oldest first
    ///
    /// Returns the number of newly queued artifacts. Files already recorded
    /// are skipped quietly; files the store cannot take yet are retried
    /// after `settle_delay`.
    pub async fn scan_existing(&mut self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.config.path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.config.path.display(), error = %e, "Failed to scan outbox");
                return 0;
            }
        };

        let mut candidates = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if !self.is_candidate(&path) {
                        continue;
                    }
                    let modified = entry
                        .metadata()
                        .await
                        .ok()
                        .filter(|m| m.is_file())
                        .and_then(|m| m.modified().ok());
                    if let Some(modified) = modified {
                        candidates.push((modified, path));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read outbox entry");
                    break;
                }
            }
        }
        candidates.sort();

        let mut queued = 0;
        for (_, path) in candidates {
            match self.submit_file(&path).await {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => self.defer(path, &e),
            }
        }

        if queued > 0 {
            info!(queued, "Queued files found in outbox at startup");
        }
        queued
    }

    /// Run the outbox event loop
    ///
    /// Returns when the uplink shuts down or the watcher channel closes.
    pub async fn run(mut self) {
        info!("Outbox watcher started");
        let shutdown = self.uplink.signals.shutdown.clone();

        loop {
            let next_due = self.settling.values().min().copied();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => error!("Filesystem watcher error: {}", e),
                    None => break,
                },
                _ = sleep_until_due(next_due) => {
                    self.submit_settled().await;
                }
            }
        }

        info!("Outbox watcher stopped");
    }

    /// Note creation and modification of candidate files
    ///
    /// Every event pushes the file's deadline back, so a file still being
    /// written is only submitted once writes stop for `settle_delay`.
    fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                let due = Instant::now() + self.config.settle_delay;
                for path in event.paths {
                    if self.is_candidate(&path) {
                        debug!(path = %path.display(), "Outbox file changed");
                        self.settling.insert(path, due);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.settling.remove(path);
                }
            }
            _ => {}
        }
    }

    async fn submit_settled(&mut self) {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .settling
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            self.settling.remove(&path);
            if let Err(e) = self.submit_file(&path).await {
                self.defer(path, &e);
            }
        }
    }

    /// Put a file the store could not take back into the settling set
    fn defer(&mut self, path: PathBuf, error: &Error) {
        warn!(
            path = %path.display(),
            error = %error,
            retry_in_ms = self.config.settle_delay.as_millis() as u64,
            "Outbox file not accepted yet, will retry"
        );
        self.settling
            .insert(path, Instant::now() + self.config.settle_delay);
    }

    /// Whether a path could be an artifact (extension matches, not hidden)
    fn is_candidate(&self, path: &Path) -> bool {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);

        !hidden && has_allowed_extension(path, &self.config.extensions)
    }

    /// Submit one outbox file, returning true when it was newly queued
    ///
    /// # Errors
    /// Returns the submission error when it is worth retrying later: the
    /// store was busy or the file could not be read for a passing reason.
    /// Other failures are logged and the file is skipped.
    async fn submit_file(&self, path: &Path) -> Result<bool> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(false),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Outbox file vanished before submission");
                return Ok(false);
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut artifact = ArtifactMetadata::named(name).with_priority(self.config.priority);
        if let Ok(modified) = metadata.modified() {
            artifact = artifact.with_created_at(DateTime::<Utc>::from(modified));
        }
        artifact.remove_payload_when_pruned = self.config.remove_after_delivery;

        match self
            .uplink
            .submit(Payload::File(path.to_path_buf()), artifact)
            .await
        {
            Ok(id) => {
                info!(artifact_id = id.0, path = %path.display(), "Queued artifact from outbox");
                Ok(true)
            }
            Err(Error::DuplicateArtifact { existing, .. }) => {
                info!(
                    existing = existing.0,
                    path = %path.display(),
                    "Outbox file already recorded"
                );
                Ok(false)
            }
            Err(e) if is_retryable(&e) => Err(e),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to queue outbox file");
                Ok(false)
            }
        }
    }
}

/// Submission failures that may clear up on their own
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::StoreUnavailable(_) => true,
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ResourceBusy
        ),
        _ => false,
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
