use super::test_helpers::*;
use super::*;
use crate::error::{CancelReason, TransferError};
use crate::types::{ArtifactState, Priority};
use chrono::{TimeZone, Utc};
use std::time::Duration;
use tempfile::TempDir;

mod control;

/// Submit an in-memory artifact with a distinct source
async fn submit_bytes(uplink: &Uplink, name: &str, data: &[u8], priority: Priority) -> ArtifactId {
    uplink
        .submit(
            Payload::Bytes(data.to_vec()),
            ArtifactMetadata::named(name)
                .with_source(format!("test:{name}"))
                .with_priority(priority),
        )
        .await
        .unwrap()
}
