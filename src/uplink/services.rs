//! Background service starters: scheduler, retention and outbox watcher.

use crate::error::Result;
use crate::outbox;

use super::Uplink;

impl Uplink {
    /// Start every background service the configuration asks for
    ///
    /// Returns the join handles; all services stop on [`Uplink::shutdown`].
    pub async fn start(&self) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = vec![self.start_scheduler(), self.start_retention_service()];
        if let Some(handle) = self.start_outbox_watcher().await? {
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Start the outbox watcher background task
    ///
    /// Files already waiting in the outbox are queued before this returns.
    pub async fn start_outbox_watcher(&self) -> Result<Option<tokio::task::JoinHandle<()>>> {
        let Some(config) = self.config.outbox.clone() else {
            tracing::info!("No outbox configured, skipping outbox watcher");
            return Ok(None);
        };

        let mut watcher = outbox::OutboxWatcher::new(self.clone(), config)?;
        watcher.start()?;
        watcher.scan_existing().await;

        let handle = tokio::spawn(async move {
            watcher.run().await;
        });

        tracing::info!("Outbox watcher background task started");

        Ok(Some(handle))
    }
}
