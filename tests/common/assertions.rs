//! Waiting helpers for integration tests

use edge_uplink::{ArtifactId, Event, Uplink};
use std::time::Duration;

/// Result of waiting for an artifact to reach a terminal state
#[derive(Debug, PartialEq)]
pub enum WaitResult {
    /// Delivery confirmed, with the remote confirmation id
    Delivered(Option<String>),
    /// Artifact was dead-lettered with this error
    DeadLettered(String),
    /// Timeout waiting for a terminal state
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for `id` to be delivered or dead-lettered
///
/// Subscribe before the artifact can finish, otherwise the event is missed.
pub async fn wait_for_terminal(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: ArtifactId,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::Delivered {
                    id: event_id,
                    confirmation_id,
                }) if event_id == id => return WaitResult::Delivered(confirmation_id),
                Ok(Event::DeadLettered {
                    id: event_id,
                    error,
                    ..
                }) if event_id == id => return WaitResult::DeadLettered(error),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

/// Collect events until `pred` matches or the timeout expires
pub async fn collect_events_until<F>(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    timeout: Duration,
    mut pred: F,
) -> Vec<Event>
where
    F: FnMut(&Event) -> bool,
{
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    seen
}

/// Poll the store until no artifact is outstanding
pub async fn wait_until_drained(uplink: &Uplink, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match uplink.stats().await {
                Ok(stats) if stats.outstanding() == 0 => return,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .is_ok()
}
