//! Single-refresh-in-flight lease, one per camera.
//!
//! Acquisition never waits: either the caller gets a [`RefreshGuard`] and
//! owns the refresh, or someone else is already on it.  The guard releases
//! the lease on drop, including during unwinding.
//!
//! A lease older than the staleness ceiling belongs to a refresher that
//! died or hung and is reclaimed by the next acquirer.  Every lease carries
//! a unique token and release only deletes a lease whose token still
//! matches, so a late holder never removes its successor's lease.
//!
//! Backends are synchronous.  Async callers go through
//! [`RefreshLocks::acquire`] and [`RefreshGuard::release`], which run the
//! lease I/O on the blocking pool; `Drop` releases inline only when a guard
//! is dropped without `release` (unwinding, cancelled tasks).

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aerocam_common::key::CameraKey;

use crate::cache::unix_secs;

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Contents of a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// `pid-<pid>` of the acquiring process.
    pub owner: String,
    /// Unix seconds.
    pub acquired_at: u64,
    pub token: String,
}

impl LockInfo {
    fn new(now: SystemTime) -> Self {
        let nanos = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self {
            owner: format!("pid-{}", std::process::id()),
            acquired_at: unix_secs(now),
            token: format!(
                "{}-{:08x}-{}",
                std::process::id(),
                nanos,
                TOKEN_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        Duration::from_secs(unix_secs(now).saturating_sub(self.acquired_at))
    }
}

/// Storage for leases.  Operations are synchronous so the guard can
/// release from `Drop`.
pub trait LockBackend: Send + Sync {
    /// Take the lease unless a live one exists.  Leases at least
    /// `stale_after` old are reclaimed.
    fn try_acquire(&self, key: &CameraKey, stale_after: Duration, now: SystemTime)
        -> Option<LockInfo>;

    /// Delete the lease if it still carries `token`.
    fn release(&self, key: &CameraKey, token: &str);

    /// Current lease, live or not.
    fn holder(&self, key: &CameraKey) -> Option<LockInfo>;
}

// ── file backend ─────────────────────────────────────────────────────────

/// `{dir}/{airport}_{cam}.lock`, created with `O_EXCL`.  Works across
/// processes sharing the directory.
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &CameraKey) -> PathBuf {
        self.dir.join(format!("{}.lock", key.stem()))
    }

    /// Parse a lease file.  A file that exists but cannot be parsed yet
    /// (creator has not written it) is dated by its mtime.
    fn read(&self, key: &CameraKey) -> io::Result<LockInfo> {
        let path = self.path(key);
        let text = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&text) {
            Ok(info) => Ok(info),
            Err(_) => {
                let modified = std::fs::metadata(&path)?.modified()?;
                Ok(LockInfo {
                    owner: "unknown".into(),
                    acquired_at: unix_secs(modified),
                    token: String::new(),
                })
            }
        }
    }

    fn create(&self, key: &CameraKey, info: &LockInfo) -> io::Result<()> {
        let path = self.path(key);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let json = serde_json::to_vec(info).map_err(io::Error::other)?;
        if let Err(e) = file.write_all(&json) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(())
    }
}

impl LockBackend for FileLocks {
    fn try_acquire(
        &self,
        key: &CameraKey,
        stale_after: Duration,
        now: SystemTime,
    ) -> Option<LockInfo> {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(camera = %key, "Cannot create lock directory: {e}");
            return None;
        }

        // Second pass only after reclaiming an abandoned lease.
        for _ in 0..2 {
            let info = LockInfo::new(now);
            match self.create(key, &info) {
                Ok(()) => return Some(info),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    warn!(camera = %key, "Cannot create refresh lock: {e}");
                    return None;
                }
            }

            let existing = match self.read(key) {
                Ok(existing) => existing,
                // Released between our create and read; try again.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(camera = %key, "Cannot read refresh lock: {e}");
                    return None;
                }
            };
            let age = existing.age(now);
            if age < stale_after {
                return None;
            }

            warn!(
                camera = %key,
                owner = %existing.owner,
                age_secs = age.as_secs(),
                "LockAbandoned: reclaiming stale refresh lock"
            );
            // Only remove the lease we judged stale.
            match self.read(key) {
                Ok(current) if current == existing => {
                    if let Err(e) = std::fs::remove_file(self.path(key)) {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(camera = %key, "Cannot remove stale lock: {e}");
                            return None;
                        }
                    }
                }
                Ok(_) => return None,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => return None,
            }
        }
        None
    }

    fn release(&self, key: &CameraKey, token: &str) {
        match self.read(key) {
            Ok(current) if current.token == token => {
                if let Err(e) = std::fs::remove_file(self.path(key)) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(camera = %key, "Cannot remove refresh lock: {e}");
                    }
                }
            }
            Ok(current) => {
                debug!(
                    camera = %key,
                    owner = %current.owner,
                    "Refresh lock was reclaimed by another owner; leaving it"
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(camera = %key, "Cannot read refresh lock on release: {e}"),
        }
    }

    fn holder(&self, key: &CameraKey) -> Option<LockInfo> {
        self.read(key).ok()
    }
}

// ── memory backend ───────────────────────────────────────────────────────

/// In-process leases for single-instance deployments.
#[derive(Default)]
pub struct MemoryLocks {
    leases: Mutex<HashMap<CameraKey, LockInfo>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for MemoryLocks {
    fn try_acquire(
        &self,
        key: &CameraKey,
        stale_after: Duration,
        now: SystemTime,
    ) -> Option<LockInfo> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = leases.get(key) {
            let age = existing.age(now);
            if age < stale_after {
                return None;
            }
            warn!(
                camera = %key,
                owner = %existing.owner,
                age_secs = age.as_secs(),
                "LockAbandoned: reclaiming stale refresh lock"
            );
        }
        let info = LockInfo::new(now);
        leases.insert(key.clone(), info.clone());
        Some(info)
    }

    fn release(&self, key: &CameraKey, token: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.get(key).is_some_and(|l| l.token == token) {
            leases.remove(key);
        }
    }

    fn holder(&self, key: &CameraKey) -> Option<LockInfo> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

// ── guard ────────────────────────────────────────────────────────────────

/// Lease handle; releasing happens on drop.
pub struct RefreshGuard {
    backend: Arc<dyn LockBackend>,
    key: CameraKey,
    info: LockInfo,
}

impl RefreshGuard {
    pub fn key(&self) -> &CameraKey {
        &self.key
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Give the lease back from the blocking pool.
    pub async fn release(self) {
        if let Err(e) = tokio::task::spawn_blocking(move || drop(self)).await {
            warn!("Refresh lock release task failed: {e}");
        }
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.backend.release(&self.key, &self.info.token);
    }
}

/// Front door to a [`LockBackend`] with the configured staleness ceiling.
#[derive(Clone)]
pub struct RefreshLocks {
    backend: Arc<dyn LockBackend>,
    stale_after: Duration,
}

impl RefreshLocks {
    pub fn new(backend: Arc<dyn LockBackend>, stale_after: Duration) -> Self {
        Self {
            backend,
            stale_after,
        }
    }

    pub fn try_acquire(&self, key: &CameraKey) -> Option<RefreshGuard> {
        let info = self
            .backend
            .try_acquire(key, self.stale_after, SystemTime::now())?;
        Some(RefreshGuard {
            backend: self.backend.clone(),
            key: key.clone(),
            info,
        })
    }

    /// [`Self::try_acquire`] on the blocking pool.
    pub async fn acquire(&self, key: &CameraKey) -> Option<RefreshGuard> {
        let locks = self.clone();
        let key = key.clone();
        match tokio::task::spawn_blocking(move || locks.try_acquire(&key)).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Refresh lock task failed: {e}");
                None
            }
        }
    }

    /// A live (non-abandoned) lease exists.
    pub fn is_held(&self, key: &CameraKey) -> bool {
        self.backend
            .holder(key)
            .is_some_and(|l| l.age(SystemTime::now()) < self.stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Duration = Duration::from_secs(300);

    fn key() -> CameraKey {
        CameraKey::new("kspb", 0).unwrap()
    }

    fn backends(dir: &std::path::Path) -> Vec<Arc<dyn LockBackend>> {
        vec![Arc::new(FileLocks::new(dir)), Arc::new(MemoryLocks::new())]
    }

    #[test]
    fn test_second_acquire_fails_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(tmp.path()) {
            let locks = RefreshLocks::new(backend, CEILING);
            let guard = locks.try_acquire(&key()).unwrap();
            assert!(locks.is_held(&key()));
            assert!(locks.try_acquire(&key()).is_none());

            drop(guard);
            assert!(!locks.is_held(&key()));
            assert!(locks.try_acquire(&key()).is_some());
        }
    }

    #[test]
    fn test_cameras_lock_independently() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(tmp.path()) {
            let locks = RefreshLocks::new(backend, CEILING);
            let _a = locks.try_acquire(&key()).unwrap();
            let _b = locks.try_acquire(&CameraKey::new("kspb", 1).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_file_lock_records_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = RefreshLocks::new(Arc::new(FileLocks::new(tmp.path())), CEILING);
        let guard = locks.try_acquire(&key()).unwrap();

        let text = std::fs::read_to_string(tmp.path().join("kspb_0.lock")).unwrap();
        let info: LockInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(info.owner, format!("pid-{}", std::process::id()));
        assert_eq!(&info, guard.info());
    }

    #[test]
    fn test_stale_file_lock_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let abandoned = LockInfo {
            owner: "pid-1".into(),
            acquired_at: unix_secs(SystemTime::now() - Duration::from_secs(301)),
            token: "dead".into(),
        };
        std::fs::write(
            tmp.path().join("kspb_0.lock"),
            serde_json::to_vec(&abandoned).unwrap(),
        )
        .unwrap();

        let locks = RefreshLocks::new(Arc::new(FileLocks::new(tmp.path())), CEILING);
        assert!(!locks.is_held(&key()));
        let guard = locks.try_acquire(&key()).unwrap();
        assert_ne!(guard.info().token, "dead");
    }

    #[test]
    fn test_fresh_unparsable_lock_is_respected() {
        // Creator has not written its JSON yet.
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("kspb_0.lock"), b"").unwrap();
        let locks = RefreshLocks::new(Arc::new(FileLocks::new(tmp.path())), CEILING);
        assert!(locks.try_acquire(&key()).is_none());
    }

    #[test]
    fn test_late_release_keeps_successor_lock() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(tmp.path()) {
            // Zero ceiling: every lease is immediately reclaimable.
            let locks = RefreshLocks::new(backend.clone(), Duration::ZERO);
            let first = locks.try_acquire(&key()).unwrap();
            let second = locks.try_acquire(&key()).unwrap();

            drop(first);
            let holder = backend.holder(&key()).unwrap();
            assert_eq!(holder.token, second.info().token);

            drop(second);
            assert!(backend.holder(&key()).is_none());
        }
    }

    #[test]
    fn test_guard_released_on_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = RefreshLocks::new(Arc::new(FileLocks::new(tmp.path())), CEILING);
        let inner = locks.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.try_acquire(&key()).unwrap();
            panic!("refresh blew up");
        }));
        assert!(result.is_err());
        assert!(!tmp.path().join("kspb_0.lock").exists());
        assert!(locks.try_acquire(&key()).is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(tmp.path()) {
            let locks = RefreshLocks::new(backend, CEILING);
            let guard = locks.acquire(&key()).await.unwrap();
            assert!(locks.acquire(&key()).await.is_none());
            assert!(locks.is_held(&key()));

            guard.release().await;
            assert!(!locks.is_held(&key()));
            assert!(locks.acquire(&key()).await.is_some());
            assert!(!locks.is_held(&key()));
        }
    }

    #[tokio::test]
    async fn test_panicking_task_releases_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = RefreshLocks::new(Arc::new(FileLocks::new(tmp.path())), CEILING);
        let guard = locks.acquire(&key()).await.unwrap();

        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("refresh blew up");
        });
        assert!(task.await.is_err());
        assert!(!locks.is_held(&key()));
    }
}
