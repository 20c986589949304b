//! Per-camera circuit breaker.
//!
//! Every failed refresh opens the breaker for an exponentially growing
//! backoff; while open, refresh attempts are skipped entirely (no lock, no
//! fetch).  The breaker closes on its own once the backoff expires and is
//! reset by the next successful fetch.
//!
//! Records are advisory: concurrent updates are last-write-wins.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use aerocam_capture::Severity;
use aerocam_common::key::CameraKey;

use crate::cache::unix_secs;

/// Persisted failure record for one camera.  Absent means "closed, healthy".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub failures: u32,
    /// Unix seconds of the most recent failure.
    pub last_failure: u64,
    /// Unix seconds before which no refresh is attempted.
    pub backoff_until: u64,
    pub last_severity: Severity,
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(3600),
        }
    }
}

impl BreakerPolicy {
    /// `base * 2^(failures-1) * severity multiplier`, capped at `max`.
    pub fn backoff(&self, failures: u32, severity: Severity) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let secs = self
            .base
            .as_secs()
            .saturating_mul(1u64 << exponent)
            .saturating_mul(u64::from(severity.multiplier()));
        Duration::from_secs(secs.min(self.max.as_secs()))
    }
}

/// Outcome of [`CircuitBreaker::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerCheck {
    /// Open breaker: the caller must not fetch.
    pub skip: bool,
    pub backoff_remaining: Duration,
    pub failures: u32,
}

impl BreakerCheck {
    fn closed(failures: u32) -> Self {
        Self {
            skip: false,
            backoff_remaining: Duration::ZERO,
            failures,
        }
    }
}

// ── storage ──────────────────────────────────────────────────────────────

/// Where breaker records live.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, key: &CameraKey) -> io::Result<Option<BreakerState>>;
    async fn save(&self, key: &CameraKey, state: &BreakerState) -> io::Result<()>;
    async fn reset(&self, key: &CameraKey) -> io::Result<()>;
}

/// One JSON file per camera: `{dir}/{airport}_{cam}.breaker.json`.
pub struct FileBreakerStore {
    dir: PathBuf,
}

static BREAKER_TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

impl FileBreakerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &CameraKey) -> PathBuf {
        self.dir.join(format!("{}.breaker.json", key.stem()))
    }
}

#[async_trait]
impl BreakerStore for FileBreakerStore {
    async fn load(&self, key: &CameraKey) -> io::Result<Option<BreakerState>> {
        let text = match tokio::fs::read_to_string(self.path(key)).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_str(&text) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // Unreadable record: behave as closed rather than wedge the camera.
                warn!(camera = %key, "Ignoring corrupt breaker record: {e}");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &CameraKey, state: &BreakerState) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec(state).map_err(io::Error::other)?;
        let temp = self.dir.join(format!(
            ".{}.breaker.{}.{}.tmp",
            key.stem(),
            std::process::id(),
            BREAKER_TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = tokio::fs::write(&temp, &json).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        tokio::fs::rename(&temp, self.path(key)).await
    }

    async fn reset(&self, key: &CameraKey) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-process records for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryBreakerStore {
    records: Mutex<HashMap<CameraKey, BreakerState>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn load(&self, key: &CameraKey) -> io::Result<Option<BreakerState>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &CameraKey, state: &BreakerState) -> io::Result<()> {
        self.records.lock().await.insert(key.clone(), state.clone());
        Ok(())
    }

    async fn reset(&self, key: &CameraKey) -> io::Result<()> {
        self.records.lock().await.remove(key);
        Ok(())
    }
}

// ── breaker ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    store: Arc<dyn BreakerStore>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy, store: Arc<dyn BreakerStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> BreakerPolicy {
        self.policy
    }

    pub async fn check(&self, key: &CameraKey) -> BreakerCheck {
        self.check_at(key, SystemTime::now()).await
    }

    /// Whether a refresh may be attempted at `now`.
    pub async fn check_at(&self, key: &CameraKey, now: SystemTime) -> BreakerCheck {
        let Some(state) = self.state(key).await else {
            return BreakerCheck::closed(0);
        };
        let now = unix_secs(now);
        if now >= state.backoff_until {
            return BreakerCheck::closed(state.failures);
        }
        BreakerCheck {
            skip: true,
            backoff_remaining: Duration::from_secs(state.backoff_until - now),
            failures: state.failures,
        }
    }

    /// Current record. Storage errors read as "no record".
    pub async fn state(&self, key: &CameraKey) -> Option<BreakerState> {
        match self.store.load(key).await {
            Ok(state) => state,
            Err(e) => {
                warn!(camera = %key, "Breaker record unreadable: {e}");
                None
            }
        }
    }

    pub async fn record_success(&self, key: &CameraKey) {
        if let Some(previous) = self.state(key).await {
            info!(
                camera = %key,
                failures = previous.failures,
                "Camera recovered, breaker reset"
            );
        }
        if let Err(e) = self.store.reset(key).await {
            warn!(camera = %key, "Cannot reset breaker record: {e}");
        }
    }

    pub async fn record_failure(&self, key: &CameraKey, severity: Severity) -> BreakerState {
        self.record_failure_at(key, severity, SystemTime::now()).await
    }

    /// Count one more consecutive failure at `now` and extend the backoff.
    pub async fn record_failure_at(
        &self,
        key: &CameraKey,
        severity: Severity,
        now: SystemTime,
    ) -> BreakerState {
        let previous = self.state(key).await;
        let failures = previous.as_ref().map_or(0, |s| s.failures).saturating_add(1);
        let backoff = self.policy.backoff(failures, severity);
        let now = unix_secs(now);
        let backoff_until = previous
            .as_ref()
            .map_or(0, |s| s.backoff_until)
            .max(now.saturating_add(backoff.as_secs()));

        let state = BreakerState {
            failures,
            last_failure: now,
            backoff_until,
            last_severity: severity,
        };
        if let Err(e) = self.store.save(key, &state).await {
            warn!(camera = %key, "Cannot persist breaker record: {e}");
        }
        debug!(
            camera = %key,
            failures,
            backoff_secs = backoff.as_secs(),
            "Breaker opened"
        );
        state
    }
}
