//! Fetch failures and the breaker severity they map to.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a frame could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The source did not produce a frame within its wall-clock ceiling.
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Non-zero ffmpeg exit, malformed stream, HTTP error status, nothing uploaded.
    #[error("capture failed: {0}")]
    Process(String),

    /// DNS failure, refused or unroutable connection.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("frame too small: {size} bytes (minimum {min})")]
    TooSmall { size: usize, min: usize },

    #[error("authentication rejected: {0}")]
    AuthFailure(String),
}

/// How hard the circuit breaker should back off after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Likely to clear up on its own (timeouts, flaky streams).
    Transient,
    /// Needs a human or a network change (bad credentials, DNS, unroutable host).
    Persistent,
}

impl Severity {
    /// Factor applied to the exponential backoff.
    pub fn multiplier(&self) -> u32 {
        match self {
            Severity::Transient => 1,
            Severity::Persistent => 2,
        }
    }
}

impl FetchError {
    pub fn severity(&self) -> Severity {
        match self {
            FetchError::NetworkUnreachable(_) | FetchError::AuthFailure(_) => Severity::Persistent,
            FetchError::Timeout(_) | FetchError::Process(_) | FetchError::TooSmall { .. } => {
                Severity::Transient
            }
        }
    }

    /// Short machine-readable kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Process(_) => "process",
            FetchError::NetworkUnreachable(_) => "network_unreachable",
            FetchError::TooSmall { .. } => "too_small",
            FetchError::AuthFailure(_) => "auth_failure",
        }
    }

    /// Map a reqwest failure. `timeout` is the budget that was in force.
    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else if err.is_connect() {
            FetchError::NetworkUnreachable(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status.as_u16())
        } else {
            FetchError::Process(err.to_string())
        }
    }

    /// Map a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FetchError::AuthFailure(format!("HTTP {status}")),
            _ => FetchError::Process(format!("HTTP {status}")),
        }
    }
}
