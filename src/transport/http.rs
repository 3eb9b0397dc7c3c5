//! Resumable chunked upload over HTTP(S)
//!
//! ```text
//! POST /uploads                     {name, source, size, checksum, created_at, priority}
//!                                   -> {upload_id, offset}
//! GET  /uploads/{id}                -> {upload_id, offset}      404 = session gone
//! PUT  /uploads/{id}                Content-Range: bytes a-b/total, one chunk
//!                                   -> {offset}
//! POST /uploads/{id}/complete       {checksum} -> {confirmation_id?, checksum?}
//! ```
//!
//! The remote offset is authoritative: every chunk starts where the endpoint
//! says it has data up to.

use super::{Delivery, ProgressSink, Transport, UploadSession};
use crate::config::UploadConfig;
use crate::error::{CancelReason, Error, Result, TransferError};
use crate::retry::{Classify, FailureClass, classify_status};
use crate::speed_limiter::SpeedLimiter;
use crate::types::Priority;
use crate::utils::sha256_file;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Serialize)]
struct CreateUpload<'a> {
    name: &'a str,
    source: &'a str,
    size: u64,
    checksum: &'a str,
    created_at: DateTime<Utc>,
    priority: Priority,
}

#[derive(Deserialize)]
struct UploadStatus {
    upload_id: String,
    #[serde(default)]
    offset: u64,
}

#[derive(Deserialize)]
struct ChunkAck {
    offset: u64,
}

#[derive(Serialize)]
struct CompleteUpload<'a> {
    checksum: &'a str,
}

#[derive(Deserialize)]
struct CompleteAck {
    #[serde(default)]
    confirmation_id: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
}

/// [`Transport`] for the resumable HTTP collection protocol
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    credential: Option<String>,
    chunk_size: usize,
    limiter: SpeedLimiter,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("authenticated", &self.credential.is_some())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl HttpTransport {
    /// Build the transport from configuration
    ///
    /// The credential reference is resolved once, here.
    pub fn new(config: &UploadConfig, limiter: SpeedLimiter) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| Error::Config {
            message: "a remote endpoint is required".to_string(),
            key: Some("UPLINK_ENDPOINT".to_string()),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::Config {
                message: format!("endpoint {} cannot carry a path", endpoint),
                key: Some("UPLINK_ENDPOINT".to_string()),
            });
        }

        let credential = config
            .credential
            .as_ref()
            .map(|c| c.resolve())
            .transpose()?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(std::time::Duration::from_secs(30)))
            .user_agent(concat!("edge-uplink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            credential,
            chunk_size: config.chunk_size.max(1),
            limiter,
        })
    }

    fn url(&self, segments: &[&str]) -> std::result::Result<Url, TransferError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TransferError::Permanent(format!("invalid endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Look up an existing remote session; `None` when the endpoint forgot it
    async fn probe(&self, token: &str) -> std::result::Result<Option<u64>, TransferError> {
        let response = self
            .authorized(self.client.get(self.url(&["uploads", token])?))
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status: UploadStatus = parse(response).await?;
        Ok(Some(status.offset))
    }

    async fn create(&self, session: &UploadSession) -> std::result::Result<UploadStatus, TransferError> {
        let body = CreateUpload {
            name: &session.name,
            source: &session.source,
            size: session.size,
            checksum: &session.checksum,
            created_at: session.created_at,
            priority: session.priority,
        };
        let response = self
            .authorized(self.client.post(self.url(&["uploads"])?))
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        parse(response).await
    }

    async fn send_chunk(
        &self,
        token: &str,
        offset: u64,
        chunk: Vec<u8>,
        total: u64,
    ) -> std::result::Result<u64, TransferError> {
        let end = offset + chunk.len() as u64 - 1;
        let response = self
            .authorized(self.client.put(self.url(&["uploads", token])?))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, total))
            .body(chunk)
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransferError::SessionExpired(format!(
                "upload {} no longer exists on the endpoint",
                token
            )));
        }
        let ack: ChunkAck = parse(response).await?;
        Ok(ack.offset)
    }

    async fn complete(&self, token: &str, checksum: &str) -> std::result::Result<CompleteAck, TransferError> {
        let response = self
            .authorized(self.client.post(self.url(&["uploads", token, "complete"])?))
            .json(&CompleteUpload { checksum })
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransferError::SessionExpired(format!(
                "upload {} expired before completion",
                token
            )));
        }
        parse(response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(
        &self,
        session: &mut UploadSession,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> std::result::Result<Delivery, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled(CancelReason::Shutdown));
        }

        verify_payload(&session.payload_path, &session.checksum, session.size).await?;

        // Resume the remote session if it still exists
        if let Some(token) = session.resume_token.clone() {
            match self.probe(&token).await? {
                Some(offset) => {
                    tracing::debug!(
                        artifact_id = session.artifact_id.0,
                        offset,
                        "resuming upload session"
                    );
                    session.bytes_transferred = offset.min(session.size);
                }
                None => {
                    tracing::info!(
                        artifact_id = session.artifact_id.0,
                        "upload session expired, restarting from zero"
                    );
                    session.reset();
                    progress.checkpoint(None, 0, session.size).await;
                }
            }
        }

        let token = match session.resume_token.clone() {
            Some(token) => token,
            None => {
                let created = self.create(session).await?;
                session.resume_token = Some(created.upload_id.clone());
                session.bytes_transferred = created.offset.min(session.size);
                progress
                    .checkpoint(Some(&created.upload_id), session.bytes_transferred, session.size)
                    .await;
                created.upload_id
            }
        };

        let mut file = tokio::fs::File::open(&session.payload_path)
            .await
            .map_err(io_error)?;
        let mut buf = vec![0u8; self.chunk_size];

        while session.bytes_transferred < session.size {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled(CancelReason::Shutdown));
            }

            let offset = session.bytes_transferred;
            let len = (session.size - offset).min(self.chunk_size as u64) as usize;
            file.seek(SeekFrom::Start(offset)).await.map_err(io_error)?;
            file.read_exact(&mut buf[..len]).await.map_err(io_error)?;

            // A throttled chunk can wait for a long time on a tight ceiling
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TransferError::Cancelled(CancelReason::Shutdown));
                }
                _ = self.limiter.acquire(len as u64) => {}
            }

            let acked = match self
                .send_chunk(&token, offset, buf[..len].to_vec(), session.size)
                .await
            {
                Ok(acked) => acked,
                Err(e @ TransferError::SessionExpired(_)) => {
                    session.reset();
                    progress.checkpoint(None, 0, session.size).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            if acked > session.size {
                return Err(TransferError::Permanent(format!(
                    "endpoint acknowledged {} bytes of a {} byte payload",
                    acked, session.size
                )));
            }
            if acked <= offset {
                return Err(TransferError::Transient(format!(
                    "endpoint made no progress at offset {}",
                    offset
                )));
            }

            session.bytes_transferred = acked;
            progress.checkpoint(Some(&token), acked, session.size).await;
        }

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled(CancelReason::Shutdown));
        }

        let ack = match self.complete(&token, &session.checksum).await {
            Ok(ack) => ack,
            Err(e @ TransferError::SessionExpired(_)) => {
                session.reset();
                progress.checkpoint(None, 0, session.size).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Some(remote) = ack.checksum
            && !remote.eq_ignore_ascii_case(&session.checksum)
        {
            return Err(TransferError::ChecksumMismatch {
                expected: session.checksum.clone(),
                actual: remote,
            });
        }

        Ok(Delivery {
            confirmation_id: ack.confirmation_id,
            bytes: session.bytes_transferred,
        })
    }
}

/// Recompute the payload checksum and compare it with the recorded one
async fn verify_payload(
    path: &Path,
    expected: &str,
    expected_size: u64,
) -> std::result::Result<(), TransferError> {
    let (actual, size) = sha256_file(path).await.map_err(io_error)?;
    if actual != expected {
        return Err(TransferError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    if size != expected_size {
        return Err(TransferError::Permanent(format!(
            "payload is {} bytes, {} were recorded",
            size, expected_size
        )));
    }
    Ok(())
}

async fn parse<T: DeserializeOwned>(response: Response) -> std::result::Result<T, TransferError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    response.json::<T>().await.map_err(|e| {
        TransferError::Transient(format!("malformed response from endpoint: {}", e))
    })
}

fn status_error(status: StatusCode, body: &str) -> TransferError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail.chars().take(200).collect::<String>())
    };
    match classify_status(status) {
        FailureClass::Transient => TransferError::Transient(message),
        _ => TransferError::Permanent(message),
    }
}

fn request_error(e: reqwest::Error) -> TransferError {
    match e.classify() {
        FailureClass::Permanent => TransferError::Permanent(e.to_string()),
        _ => TransferError::Transient(e.to_string()),
    }
}

fn io_error(e: std::io::Error) -> TransferError {
    let message = format!("payload unreadable: {}", e);
    match e.classify() {
        FailureClass::Permanent => TransferError::Permanent(message),
        _ => TransferError::Transient(message),
    }
}
