//! In-process fake of the remote collection endpoint
//!
//! Speaks the resumable upload protocol on top of a wiremock server: sessions
//! are created on `POST /v1/uploads`, every `PUT` is acknowledged up to the end
//! of its `Content-Range`, and `complete` echoes the checksum it was sent.

use edge_uplink::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Hands out a fresh upload id per session
pub struct CreateSession {
    next: AtomicU64,
}

impl Respond for CreateSession {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(201)
            .set_body_json(serde_json::json!({ "upload_id": format!("u-{n}"), "offset": 0 }))
    }
}

/// Acknowledges each chunk up to the end of its range
pub struct AckRange;

impl Respond for AckRange {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let end = request
            .headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range_end);
        match end {
            Some(end) => {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "offset": end + 1 }))
            }
            None => ResponseTemplate::new(400).set_body_string("bad Content-Range"),
        }
    }
}

/// Confirms the upload and echoes the checksum back
pub struct Confirm;

impl Respond for Confirm {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let upload_id = request
            .url
            .path_segments()
            .and_then(|mut s| s.nth(2))
            .unwrap_or_default()
            .to_string();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "confirmation_id": format!("rcpt-{upload_id}"),
            "checksum": body["checksum"],
        }))
    }
}

fn parse_range_end(header: &str) -> Option<u64> {
    let range = header.strip_prefix("bytes ")?;
    let (span, _total) = range.split_once('/')?;
    let (_start, end) = span.split_once('-')?;
    end.parse().ok()
}

/// Start a collector that accepts every upload
pub async fn start_collector() -> MockServer {
    let server = MockServer::start().await;
    mount_collector(&server).await;
    server
}

/// Mount the happy-path protocol handlers on `server`
pub async fn mount_collector(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/uploads"))
        .respond_with(CreateSession {
            next: AtomicU64::new(0),
        })
        .mount(server)
        .await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/v1/uploads/[^/]+$"))
        .respond_with(AckRange)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/uploads/[^/]+/complete$"))
        .respond_with(Confirm)
        .mount(server)
        .await;
}

/// Bytes the collector received, in request order
pub async fn received_bytes(server: &MockServer) -> Vec<u8> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .flat_map(|r| r.body)
        .collect()
}

/// Number of sessions the collector was asked to open
pub async fn sessions_created(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/v1/uploads")
        .count()
}

/// Configuration pointed at `server`, with a store inside a fresh temp dir
pub fn collector_config(server: &MockServer) -> (Config, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    let mut config = Config::default();
    config.upload.endpoint = Some(
        format!("{}/v1/", server.uri())
            .parse()
            .expect("mock server URI is a valid URL"),
    );
    config.upload.max_concurrent_uploads = 2;
    config.upload.chunk_size = 4;
    config.upload.request_timeout = Duration::from_secs(5);
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(100);
    config.retry.jitter = false;
    config.persistence.store_dir = dir.path().join("store");
    config.scheduler.poll_interval = Duration::from_millis(20);
    config.scheduler.shutdown_grace = Duration::from_secs(5);

    (config, dir)
}
