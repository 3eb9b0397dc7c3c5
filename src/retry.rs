//! Retry and failure policy
//!
//! Failed transfer attempts are not retried in a loop here. Instead the policy
//! turns a classified failure plus the persisted attempt count into a
//! [`RetryDecision`], and the upload task applies that decision as a single
//! store transition. The attempt counter lives in the store, so the schedule
//! survives restarts.
//!
//! ```text
//! Transient            -> Retry { delay }   (store dead-letters at max_attempts)
//! Permanent / checksum -> Abandon           (dead after one attempt)
//! Cancelled(shutdown)  -> Requeue           (no penalty)
//! Cancelled(deadline)  -> Retry { delay }
//! ```

use crate::config::RetryConfig;
use crate::error::{CancelReason, TransferError};
use rand::Rng;
use std::time::Duration;

/// Coarse failure class used by the policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying later (network trouble, timeouts, 5xx)
    Transient,
    /// Retrying cannot succeed (rejected payload, checksum mismatch)
    Permanent,
    /// Interrupted locally; the remote side did nothing wrong
    Cancelled,
}

/// Trait for errors that can be classified for the retry policy
pub trait Classify {
    /// Which failure class this error belongs to
    fn classify(&self) -> FailureClass;
}

/// Transfer outcomes map onto failure classes by variant.
///
/// A local cancellation is normally [`FailureClass::Cancelled`] and costs no
/// attempt. The one exception is an attempt cut off by its own transfer
/// deadline: it is classified [`FailureClass::Transient`] and counted, so a
/// payload that never fits the deadline is eventually dead-lettered instead
/// of being requeued forever.
impl Classify for TransferError {
    fn classify(&self) -> FailureClass {
        match self {
            TransferError::Transient(_) | TransferError::SessionExpired(_) => {
                FailureClass::Transient
            }
            TransferError::Permanent(_) | TransferError::ChecksumMismatch { .. } => {
                FailureClass::Permanent
            }
            // Counted; see above
            TransferError::Cancelled(CancelReason::Deadline) => FailureClass::Transient,
            TransferError::Cancelled(CancelReason::Shutdown) => FailureClass::Cancelled,
        }
    }
}

impl Classify for std::io::Error {
    fn classify(&self) -> FailureClass {
        use std::io::ErrorKind;
        match self.kind() {
            // The payload vanished or is unreadable; it will not come back on its own
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidData => {
                FailureClass::Permanent
            }
            _ => FailureClass::Transient,
        }
    }
}

impl Classify for reqwest::Error {
    fn classify(&self) -> FailureClass {
        if let Some(status) = self.status() {
            return classify_status(status);
        }
        if self.is_builder() || self.is_redirect() {
            return FailureClass::Permanent;
        }
        // connect, timeout, request, body and decode errors
        FailureClass::Transient
    }
}

/// Classify an HTTP status code returned by the remote endpoint
pub fn classify_status(status: reqwest::StatusCode) -> FailureClass {
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// What to do with an artifact whose attempt just failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Count the failure and try again after `delay`
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Move straight to the dead-letter state
    Abandon,
    /// Return to the queue without counting the attempt
    Requeue,
}

/// Backoff and abandonment rules
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    ceiling: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Build the policy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.initial_delay,
            ceiling: config.max_delay,
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: config.jitter,
        }
    }

    /// Attempts allowed before an artifact is dead-lettered
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay after a failure when `attempts` earlier attempts had already failed
    ///
    /// `min(ceiling, base * multiplier^attempts)`, non-decreasing in `attempts`.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.ceiling.as_secs_f64() {
            self.ceiling
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay after a failure when `attempts` earlier attempts had already failed
    pub fn backoff(&self, attempts: u32) -> Duration {
        let delay = self.base_delay(attempts);
        if self.jitter { add_jitter(delay) } else { delay }
    }

    /// Decide what happens after an attempt failed with `error`
    ///
    /// `attempts` is the persisted count of failed attempts *before* this one.
    /// Whether a retry turns into a dead letter at `max_attempts` is decided by
    /// the store when the failure is recorded.
    pub fn decide(&self, error: &TransferError, attempts: u32) -> RetryDecision {
        match error.classify() {
            FailureClass::Transient => RetryDecision::Retry {
                delay: self.backoff(attempts),
            },
            FailureClass::Permanent => RetryDecision::Abandon,
            FailureClass::Cancelled => RetryDecision::Requeue,
        }
    }

    /// Whether recording one more failure exhausts the attempt budget
    pub fn is_exhausted(&self, attempts_after_failure: u32) -> bool {
        attempts_after_failure >= self.max_attempts
    }
}

/// Add random jitter to a delay to prevent synchronized retry storms
///
/// Jitter is uniformly distributed in `[0, delay)`, so the result lies in
/// `[delay, 2 * delay)`.
fn add_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
