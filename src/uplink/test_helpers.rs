//! Shared test helpers: a scripted transport and ready-made Uplink instances.

use crate::config::Config;
use crate::error::{CancelReason, TransferError};
use crate::transport::{Delivery, ProgressSink, Transport, UploadSession};
use crate::types::{ArtifactId, ArtifactInfo, ArtifactState, Event};
use crate::uplink::Uplink;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What the mock does on one call to `upload`
#[derive(Clone, Debug)]
pub(crate) enum Step {
    /// Acknowledge the whole payload and confirm delivery
    Deliver,
    /// Fail straight away
    Fail(TransferError),
    /// Acknowledge `bytes` under a resume token, then fail
    PartialThenFail { bytes: u64, error: TransferError },
    /// Acknowledge `bytes`, then wait for cancellation
    Hang { bytes: u64 },
    /// Ignore cancellation and sleep
    Stuck(Duration),
}

/// One recorded call to `upload`
#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub(crate) id: ArtifactId,
    pub(crate) name: String,
    pub(crate) resume_from: u64,
    pub(crate) resume_token: Option<String>,
    pub(crate) at: Instant,
}

/// Transport that plays back a script of outcomes; delivers once the script runs out
#[derive(Default)]
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn scripted(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    /// Every call takes at least `delay` (cancellable)
    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    async fn play(
        &self,
        session: &mut UploadSession,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Delivery, TransferError> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Deliver);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TransferError::Cancelled(CancelReason::Shutdown));
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let token = session
            .resume_token
            .clone()
            .unwrap_or_else(|| format!("mock-{}", session.artifact_id));

        match step {
            Step::Deliver => {
                progress
                    .checkpoint(Some(&token), session.size, session.size)
                    .await;
                Ok(Delivery {
                    confirmation_id: Some(format!("conf-{}", session.artifact_id)),
                    bytes: session.size,
                })
            }
            Step::Fail(error) => Err(error),
            Step::PartialThenFail { bytes, error } => {
                session.resume_token = Some(token.clone());
                session.bytes_transferred = bytes;
                progress.checkpoint(Some(&token), bytes, session.size).await;
                Err(error)
            }
            Step::Hang { bytes } => {
                session.resume_token = Some(token.clone());
                session.bytes_transferred = bytes;
                progress.checkpoint(Some(&token), bytes, session.size).await;
                cancel.cancelled().await;
                Err(TransferError::Cancelled(CancelReason::Shutdown))
            }
            Step::Stuck(duration) => {
                tokio::time::sleep(duration).await;
                Err(TransferError::Transient("stuck transfer gave up".to_string()))
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn upload(
        &self,
        session: &mut UploadSession,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Delivery, TransferError> {
        self.calls.lock().unwrap().push(Call {
            id: session.artifact_id,
            name: session.name.clone(),
            resume_from: session.bytes_transferred,
            resume_token: session.resume_token.clone(),
            at: Instant::now(),
        });

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let result = self.play(session, progress, cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Config with short timings, storing everything under `dir`
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.store_dir = dir.join("store");
    config.upload.max_concurrent_uploads = 2;
    config.upload.transfer_timeout = Duration::from_secs(10);
    config.retry.max_attempts = 5;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(200);
    config.retry.jitter = false;
    config.scheduler.poll_interval = Duration::from_millis(20);
    config.scheduler.heartbeat_timeout = Duration::from_secs(30);
    config.scheduler.shutdown_grace = Duration::from_secs(5);
    config
}

/// Uplink over an always-delivering mock transport.
/// Returns the uplink and the tempdir (which must be kept alive).
pub(crate) async fn create_test_uplink() -> (Uplink, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let uplink = Uplink::with_transport(test_config(temp_dir.path()), MockTransport::new())
        .await
        .unwrap();
    (uplink, temp_dir)
}

/// Uplink over the given transport with a customized config
pub(crate) async fn create_uplink_with(
    dir: &Path,
    transport: Arc<MockTransport>,
    customize: impl FnOnce(&mut Config),
) -> Uplink {
    let mut config = test_config(dir);
    customize(&mut config);
    Uplink::with_transport(config, transport).await.unwrap()
}

/// Poll until the artifact reaches `state`
pub(crate) async fn wait_for_state(
    uplink: &Uplink,
    id: ArtifactId,
    state: ArtifactState,
) -> ArtifactInfo {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let info = uplink.artifact(id).await.unwrap();
            if info.state == state {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("artifact {id} never reached {state}"))
}

/// Wait for the first event matching `pred`
pub(crate) async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("expected event was not emitted")
}
