//! Configuration types for edge-uplink

use crate::error::{Error, Result};
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use url::Url;

/// Upload behavior configuration (endpoint, concurrency, chunking, timeouts)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Remote collection endpoint (required by the daemon)
    #[serde(default)]
    pub endpoint: Option<Url>,

    /// Where to find the bearer credential for the endpoint
    #[serde(default)]
    pub credential: Option<CredentialRef>,

    /// Maximum concurrent uploads (default: 2)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_uploads: usize,

    /// Bytes sent per request (default: 256 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bandwidth ceiling in bytes per second (None = unlimited)
    #[serde(default)]
    pub speed_limit_bps: Option<u64>,

    /// Deadline for a single transfer attempt (default: 300 seconds)
    #[serde(default = "default_transfer_timeout", with = "duration_serde")]
    pub transfer_timeout: Duration,

    /// Timeout for a single HTTP request (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            credential: None,
            max_concurrent_uploads: default_max_concurrent(),
            chunk_size: default_chunk_size(),
            speed_limit_bps: None,
            transfer_timeout: default_transfer_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Retry configuration for failed transfer attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before an artifact is dead-lettered (default: 8)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base, the delay after the first failure (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Backoff ceiling (default: 1 hour)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Artifact store location and retention
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Store directory, holds `uplink.db` and `spool/` (default: "./uplink-store")
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// How long delivered and dead-lettered records are kept (default: 7 days)
    #[serde(default = "default_retention", with = "duration_serde")]
    pub retention: Duration,

    /// How often the pruning pass runs (default: 1 hour)
    #[serde(default = "default_prune_interval", with = "duration_serde")]
    pub prune_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            retention: default_retention(),
            prune_interval: default_prune_interval(),
        }
    }
}

impl PersistenceConfig {
    /// Path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.store_dir.join("uplink.db")
    }

    /// Directory where in-memory payloads are written before acknowledgement
    pub fn spool_dir(&self) -> PathBuf {
        self.store_dir.join("spool")
    }
}

/// Scheduler timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on how long the scheduler sleeps when idle (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_millis_serde")]
    pub poll_interval: Duration,

    /// An in-flight record whose heartbeat is older than this is reclaimed (default: 120 seconds)
    #[serde(default = "default_heartbeat_timeout", with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// How long shutdown waits for in-flight transfers (default: 30 seconds)
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Watched outbox directory
///
/// Files dropped into `path` are submitted automatically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Directory to watch
    pub path: PathBuf,

    /// Priority given to artifacts picked up from the outbox
    #[serde(default)]
    pub priority: Priority,

    /// Extensions to pick up, lowercase without the dot (empty = all files)
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Wait after the last filesystem event before a file is submitted (default: 500ms)
    #[serde(default = "default_settle_delay", with = "duration_millis_serde")]
    pub settle_delay: Duration,

    /// Delete the file once its record is pruned after delivery
    #[serde(default)]
    pub remove_after_delivery: bool,
}

impl OutboxConfig {
    /// Outbox at `path` with default settings
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            priority: Priority::Normal,
            extensions: Vec::new(),
            settle_delay: default_settle_delay(),
            remove_after_delivery: false,
        }
    }
}

/// Main configuration for the uplink
///
/// Fields are organized into sub-configs:
/// - [`upload`](UploadConfig) - endpoint, concurrency, chunking, timeouts
/// - [`retry`](RetryConfig) - backoff and dead-letter threshold
/// - [`persistence`](PersistenceConfig) - store location and retention
/// - [`scheduler`](SchedulerConfig) - polling, heartbeats, shutdown grace
/// - [`outbox`](OutboxConfig) - optional watched directory
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upload behavior
    #[serde(default)]
    pub upload: UploadConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Store location and retention
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Scheduler timing
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Watched outbox directory
    #[serde(default)]
    pub outbox: Option<OutboxConfig>,
}

impl Config {
    /// Build a configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup, starting from the defaults
    ///
    /// Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(raw) = get("UPLINK_ENDPOINT") {
            let url = Url::parse(raw.trim())
                .map_err(|e| config_error("UPLINK_ENDPOINT", format!("invalid URL: {}", e)))?;
            config.upload.endpoint = Some(url);
        }
        if let Some(raw) = get("UPLINK_CREDENTIAL") {
            config.upload.credential = Some(raw.parse()?);
        }
        if let Some(n) = parse_var(&get, "UPLINK_MAX_CONCURRENT")? {
            config.upload.max_concurrent_uploads = n;
        }
        if let Some(n) = parse_var(&get, "UPLINK_CHUNK_SIZE")? {
            config.upload.chunk_size = n;
        }
        if let Some(n) = parse_var(&get, "UPLINK_SPEED_LIMIT_BPS")? {
            config.upload.speed_limit_bps = Some(n).filter(|bps| *bps > 0);
        }
        if let Some(secs) = parse_var(&get, "UPLINK_TRANSFER_TIMEOUT_SECS")? {
            config.upload.transfer_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&get, "UPLINK_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = parse_var(&get, "UPLINK_BACKOFF_BASE_SECS")? {
            config.retry.initial_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&get, "UPLINK_BACKOFF_CEILING_SECS")? {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(dir) = get("UPLINK_STORE_DIR") {
            config.persistence.store_dir = PathBuf::from(dir.trim());
        }
        if let Some(secs) = parse_var(&get, "UPLINK_RETENTION_SECS")? {
            config.persistence.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&get, "UPLINK_SHUTDOWN_GRACE_SECS")? {
            config.scheduler.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&get, "UPLINK_HEARTBEAT_TIMEOUT_SECS")? {
            config.scheduler.heartbeat_timeout = Duration::from_secs(secs);
        }

        if let Some(dir) = get("UPLINK_OUTBOX_DIR") {
            let mut outbox = OutboxConfig::new(dir.trim());
            if let Some(raw) = get("UPLINK_OUTBOX_PRIORITY") {
                outbox.priority = raw
                    .parse()
                    .map_err(|e: String| config_error("UPLINK_OUTBOX_PRIORITY", e))?;
            }
            if let Some(raw) = get("UPLINK_OUTBOX_EXTENSIONS") {
                outbox.extensions = raw
                    .split(',')
                    .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect();
            }
            if let Some(flag) = parse_var(&get, "UPLINK_OUTBOX_REMOVE_DELIVERED")? {
                outbox.remove_after_delivery = flag;
            }
            config.outbox = Some(outbox);
        }

        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_concurrent_uploads == 0 {
            return Err(config_error(
                "UPLINK_MAX_CONCURRENT",
                "max_concurrent_uploads must be at least 1",
            ));
        }
        if self.upload.chunk_size == 0 {
            return Err(config_error(
                "UPLINK_CHUNK_SIZE",
                "chunk_size must be at least 1 byte",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error(
                "UPLINK_MAX_ATTEMPTS",
                "max_attempts must be at least 1",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(config_error(
                "UPLINK_BACKOFF_BASE_SECS",
                format!(
                    "backoff base ({:?}) exceeds the ceiling ({:?})",
                    self.retry.initial_delay, self.retry.max_delay
                ),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier",
                "backoff_multiplier must be at least 1.0",
            ));
        }
        if self.scheduler.heartbeat_timeout.is_zero() {
            return Err(config_error(
                "UPLINK_HEARTBEAT_TIMEOUT_SECS",
                "heartbeat_timeout must be non-zero",
            ));
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate), and also require an endpoint (daemon mode)
    pub fn validate_for_daemon(&self) -> Result<()> {
        self.validate()?;
        if self.upload.endpoint.is_none() {
            return Err(config_error(
                "UPLINK_ENDPOINT",
                "a remote endpoint is required",
            ));
        }
        Ok(())
    }
}

/// Where the bearer credential for the remote endpoint comes from
///
/// Parsed from `env:NAME`, `file:/path`, or taken literally.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CredentialRef {
    /// Read from an environment variable at connect time
    Env(String),
    /// Read from a file at connect time (trailing whitespace trimmed)
    File(PathBuf),
    /// The credential itself
    Literal(String),
}

impl CredentialRef {
    /// Resolve the credential value
    pub fn resolve(&self) -> Result<String> {
        let value = match self {
            CredentialRef::Env(name) => std::env::var(name).map_err(|_| {
                config_error(
                    "UPLINK_CREDENTIAL",
                    format!("environment variable {} is not set", name),
                )
            })?,
            CredentialRef::File(path) => std::fs::read_to_string(path).map_err(|e| {
                config_error(
                    "UPLINK_CREDENTIAL",
                    format!("failed to read credential file {}: {}", path.display(), e),
                )
            })?,
            CredentialRef::Literal(value) => value.clone(),
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(config_error("UPLINK_CREDENTIAL", "credential is empty"));
        }
        Ok(value)
    }
}

impl FromStr for CredentialRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix("env:") {
            if name.is_empty() {
                return Err(config_error("UPLINK_CREDENTIAL", "env: needs a variable name"));
            }
            Ok(CredentialRef::Env(name.to_string()))
        } else if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err(config_error("UPLINK_CREDENTIAL", "file: needs a path"));
            }
            Ok(CredentialRef::File(PathBuf::from(path)))
        } else {
            Ok(CredentialRef::Literal(s.to_string()))
        }
    }
}

impl TryFrom<String> for CredentialRef {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CredentialRef> for String {
    fn from(credential: CredentialRef) -> Self {
        match credential {
            CredentialRef::Env(name) => format!("env:{}", name),
            CredentialRef::File(path) => format!("file:{}", path.display()),
            CredentialRef::Literal(value) => value,
        }
    }
}

// Keep literal secrets out of logs
impl std::fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialRef::Env(name) => f.debug_tuple("Env").field(name).finish(),
            CredentialRef::File(path) => f.debug_tuple("File").field(path).finish(),
            CredentialRef::Literal(_) => f.write_str("Literal(<redacted>)"),
        }
    }
}

fn config_error(key: &str, message: impl Into<String>) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

fn parse_var<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| config_error(key, format!("invalid value '{}': {}", raw.trim(), e)))
        })
        .transpose()
}

fn default_max_concurrent() -> usize {
    2
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(3600)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./uplink-store")
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(500)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
