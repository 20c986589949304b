//! Stale-while-revalidate decision for every image read.
//!
//! | freshness            | served        | refresh                      |
//! |----------------------|---------------|------------------------------|
//! | `Fresh`              | cache, HIT    | none                         |
//! | `StaleRefreshable`   | cache, STALE  | one detached background task |
//! | `StaleLocked`        | cache, STALE  | none, someone else has it    |
//! | `StaleBreakerOpen`   | cache, RL-SERVE | none until backoff expires |
//! | `Missing`            | first fetch, MISS (placeholder on failure)   |
//!
//! The stale bytes are read into memory before the refresh task is
//! spawned, and the task owns the lock guard, so the client never waits on
//! a camera and the lease is released however the task ends.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use axum::body::Bytes;
use tracing::{debug, info, warn};

use aerocam_capture::{FetchError, Frame, FrameFetcher, Severity};
use aerocam_common::cameras::{CameraSource, SourceKind};
use aerocam_common::config::{Config, Coordination};
use aerocam_common::key::{CameraKey, ImageFormat};
use aerocam_common::protocol::{BreakerReport, CameraStatus};

use crate::breaker::{
    BreakerPolicy, BreakerStore, CircuitBreaker, FileBreakerStore, MemoryBreakerStore,
};
use crate::cache::{unix_secs, CacheStore, CachedFrame};
use crate::lock::{FileLocks, LockBackend, MemoryLocks, RefreshGuard, RefreshLocks};
use crate::placeholder::Placeholder;
use crate::transcode;

/// Where a request landed in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    StaleRefreshable,
    StaleLocked,
    StaleBreakerOpen,
    Missing,
}

/// Value of the `X-Cache-Status` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    RateLimited,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::RateLimited => "RL-SERVE",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// What the read path should send back.
#[derive(Debug, Clone)]
pub struct Served {
    pub body: Bytes,
    pub format: ImageFormat,
    pub status: CacheStatus,
    pub freshness: Freshness,
    /// `None` when the placeholder is served.
    pub frame: Option<FrameMeta>,
}

/// Validators of a served cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
    pub modified: SystemTime,
    pub etag: String,
    /// Freshness left; zero for stale frames.
    pub remaining: Duration,
}

impl Served {
    fn cached(
        frame: CachedFrame,
        status: CacheStatus,
        freshness: Freshness,
        remaining: Duration,
    ) -> Self {
        let meta = FrameMeta {
            modified: frame.modified,
            etag: frame.etag(),
            remaining,
        };
        Self {
            format: frame.format,
            body: Bytes::from(frame.bytes),
            status,
            freshness,
            frame: Some(meta),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.frame.is_none()
    }
}

/// Result of one refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Push camera with no upload newer than the cached frame.
    Unchanged,
    Failed(FetchError),
    /// Fetch worked but the cache could not be written.
    StoreFailed,
    BreakerOpen,
    Locked,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    cache: CacheStore,
    breaker: CircuitBreaker,
    locks: RefreshLocks,
    fetcher: Arc<dyn FrameFetcher>,
    placeholder: Placeholder,
    transcode_webp: bool,
}

impl RefreshCoordinator {
    pub fn new(
        cache: CacheStore,
        breaker: CircuitBreaker,
        locks: RefreshLocks,
        fetcher: Arc<dyn FrameFetcher>,
        placeholder: Placeholder,
        transcode_webp: bool,
    ) -> Self {
        Self {
            cache,
            breaker,
            locks,
            fetcher,
            placeholder,
            transcode_webp,
        }
    }

    /// Wire up stores and back-ends as configured.
    pub fn from_config(config: &Config, fetcher: Arc<dyn FrameFetcher>) -> Result<Self> {
        let (lock_backend, breaker_store): (Arc<dyn LockBackend>, Arc<dyn BreakerStore>) =
            match config.coordination {
                Coordination::File => (
                    Arc::new(FileLocks::new(&config.state_dir)),
                    Arc::new(FileBreakerStore::new(&config.state_dir)),
                ),
                Coordination::Memory => (
                    Arc::new(MemoryLocks::new()),
                    Arc::new(MemoryBreakerStore::new()),
                ),
            };
        let policy = BreakerPolicy {
            base: Duration::from_secs(config.breaker_base_secs.max(1)),
            max: Duration::from_secs(config.breaker_max_secs.max(1)),
        };
        let placeholder = Placeholder::load(config.placeholder_image.as_deref())
            .context("Cannot build placeholder image")?;

        Ok(Self::new(
            CacheStore::new(&config.cache_dir),
            CircuitBreaker::new(policy, breaker_store),
            RefreshLocks::new(lock_backend, config.lock_stale_after()),
            fetcher,
            placeholder,
            config.transcode_webp,
        ))
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn locks(&self) -> &RefreshLocks {
        &self.locks
    }

    /// Placeholder response for requests that name no known camera.
    pub fn placeholder(&self, format: ImageFormat) -> Served {
        let (format, body) = self.placeholder.variant(format);
        Served {
            body,
            format,
            status: CacheStatus::Miss,
            freshness: Freshness::Missing,
            frame: None,
        }
    }

    // ── read path ────────────────────────────────────────────────────────

    /// Decide and produce the response for one image read.
    pub async fn serve(
        &self,
        key: &CameraKey,
        source: &CameraSource,
        format: ImageFormat,
    ) -> Served {
        let cached = match self.cache.read_with_fallback(key, format).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(camera = %key, "Cache unreadable, treating as missing: {e}");
                None
            }
        };
        let Some(frame) = cached else {
            return self.serve_missing(key, source, format).await;
        };

        let age = frame.age(SystemTime::now());
        if age < source.refresh_interval {
            let remaining = source.refresh_interval - age;
            return Served::cached(frame, CacheStatus::Hit, Freshness::Fresh, remaining);
        }

        let check = self.breaker.check(key).await;
        if check.skip {
            debug!(
                camera = %key,
                failures = check.failures,
                backoff_secs = check.backoff_remaining.as_secs(),
                "Breaker open, serving stale frame"
            );
            return Served::cached(
                frame,
                CacheStatus::RateLimited,
                Freshness::StaleBreakerOpen,
                Duration::ZERO,
            );
        }

        let Some(guard) = self.locks.acquire(key).await else {
            debug!(camera = %key, "Refresh already in flight");
            return Served::cached(
                frame,
                CacheStatus::Stale,
                Freshness::StaleLocked,
                Duration::ZERO,
            );
        };

        // `frame` is fully in memory; the refresh no longer touches it.
        let served = Served::cached(
            frame,
            CacheStatus::Stale,
            Freshness::StaleRefreshable,
            Duration::ZERO,
        );
        self.spawn_refresh(key.clone(), source.clone(), guard);
        served
    }

    /// No cache entry: try one synchronous fetch, else the placeholder.
    async fn serve_missing(
        &self,
        key: &CameraKey,
        source: &CameraSource,
        format: ImageFormat,
    ) -> Served {
        match self.refresh(key, source).await {
            RefreshOutcome::Refreshed | RefreshOutcome::Unchanged => {}
            _ => return self.placeholder(format),
        }

        match self.cache.read_with_fallback(key, format).await {
            Ok(Some(frame)) => {
                let remaining = source
                    .refresh_interval
                    .saturating_sub(frame.age(SystemTime::now()));
                Served::cached(frame, CacheStatus::Miss, Freshness::Missing, remaining)
            }
            Ok(None) => self.placeholder(format),
            Err(e) => {
                warn!(camera = %key, "Cannot read freshly stored frame: {e}");
                self.placeholder(format)
            }
        }
    }

    fn spawn_refresh(&self, key: CameraKey, source: CameraSource, guard: RefreshGuard) {
        let this = self.clone();
        tokio::spawn(async move {
            this.refresh_locked(&key, &source).await;
            guard.release().await;
        });
    }

    // ── refresh ──────────────────────────────────────────────────────────

    /// One breaker-gated, lock-protected refresh, awaited in place.
    pub async fn refresh(&self, key: &CameraKey, source: &CameraSource) -> RefreshOutcome {
        if self.breaker.check(key).await.skip {
            return RefreshOutcome::BreakerOpen;
        }
        let Some(guard) = self.locks.acquire(key).await else {
            return RefreshOutcome::Locked;
        };
        let outcome = self.refresh_locked(key, source).await;
        guard.release().await;
        outcome
    }

    /// Fetch, store, update the breaker.  The caller holds the lease.
    async fn refresh_locked(&self, key: &CameraKey, source: &CameraSource) -> RefreshOutcome {
        if self.upload_unchanged(key, source).await {
            debug!(camera = %key, "No newer push upload, keeping cached frame");
            return RefreshOutcome::Unchanged;
        }

        let started = Instant::now();
        let frame = match self.fetcher.fetch(key, source).await {
            Ok(frame) => frame,
            Err(e) => {
                let state = self.breaker.record_failure(key, e.severity()).await;
                warn!(
                    camera = %key,
                    source = source.kind.as_str(),
                    kind = e.kind(),
                    failures = state.failures,
                    backoff_until = state.backoff_until,
                    "Refresh failed: {e}"
                );
                return RefreshOutcome::Failed(e);
            }
        };

        if let Err(e) = self.store(key, frame).await {
            warn!(camera = %key, "Cannot store fetched frame: {e:#}");
            self.breaker.record_failure(key, Severity::Transient).await;
            return RefreshOutcome::StoreFailed;
        }

        self.breaker.record_success(key).await;
        info!(
            camera = %key,
            source = source.kind.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Frame refreshed"
        );
        RefreshOutcome::Refreshed
    }

    /// The newest push upload is already what the cache holds.  Cached push
    /// frames carry the upload's mtime, compared at whole seconds.
    async fn upload_unchanged(&self, key: &CameraKey, source: &CameraSource) -> bool {
        if source.kind != SourceKind::Push {
            return false;
        }
        let Some(uploaded) = self.fetcher.latest_capture(key, source).await else {
            return false;
        };
        match self.cache.modified(key, ImageFormat::Jpeg).await {
            Ok(Some(cached)) => unix_secs(uploaded) <= unix_secs(cached),
            _ => false,
        }
    }

    /// Write the JPEG original and, if enabled, the WebP variant.
    async fn store(&self, key: &CameraKey, frame: Frame) -> Result<()> {
        let captured_at = frame.captured_at;
        let jpeg = transcode::to_jpeg(frame.bytes, frame.kind).await?;
        self.cache
            .write(key, ImageFormat::Jpeg, &jpeg, captured_at)
            .await
            .context("JPEG cache write failed")?;

        if !self.transcode_webp {
            return Ok(());
        }
        let webp = match transcode::to_webp(jpeg).await {
            Ok(webp) => self
                .cache
                .write(key, ImageFormat::Webp, &webp, captured_at)
                .await
                .context("WebP cache write failed"),
            Err(e) => Err(e),
        };
        if let Err(e) = webp {
            // Old WebP would outlive the new JPEG; let reads fall back instead.
            warn!(camera = %key, "WebP variant not updated: {e:#}");
            if let Err(e) = self.cache.remove(key, ImageFormat::Webp).await {
                warn!(camera = %key, "Cannot drop outdated WebP variant: {e}");
            }
        }
        Ok(())
    }

    // ── status ───────────────────────────────────────────────────────────

    /// Operator snapshot for one camera.
    pub async fn status(&self, key: &CameraKey, source: &CameraSource) -> CameraStatus {
        let now = SystemTime::now();
        let modified = self
            .cache
            .modified(key, ImageFormat::Jpeg)
            .await
            .unwrap_or_else(|e| {
                warn!(camera = %key, "Cannot stat cached frame: {e}");
                None
            });
        let check = self.breaker.check_at(key, now).await;

        CameraStatus {
            airport: key.airport.clone(),
            cam: key.cam,
            name: source.name.clone(),
            kind: source.kind.as_str().to_string(),
            refresh_secs: source.refresh_interval.as_secs(),
            cached: modified.is_some(),
            age_secs: modified.map(|m| now.duration_since(m).unwrap_or_default().as_secs()),
            timestamp: modified.and_then(|m| {
                chrono::DateTime::from_timestamp(unix_secs(m) as i64, 0).map(|dt| dt.to_rfc3339())
            }),
            breaker: BreakerReport {
                open: check.skip,
                failures: check.failures,
                backoff_remaining_secs: check.backoff_remaining.as_secs(),
            },
            refreshing: self.locks.is_held(key),
        }
    }
}
