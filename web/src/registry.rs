//! Live camera catalog with reload-on-change.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{error, info};

use aerocam_common::cameras::{self, CameraSource, Cameras, SourceDefaults};
use aerocam_common::key::CameraKey;

/// Shared, swappable view of `cameras.toml`.
pub struct CameraRegistry {
    current: RwLock<Arc<Cameras>>,
    source: Option<CatalogFile>,
}

struct CatalogFile {
    path: PathBuf,
    defaults: SourceDefaults,
    modified: Mutex<Option<SystemTime>>,
}

impl CameraRegistry {
    /// Load the catalog from disk; later calls to [`reload_if_changed`]
    /// watch the same file.
    ///
    /// [`reload_if_changed`]: CameraRegistry::reload_if_changed
    pub fn load(path: &Path, defaults: SourceDefaults) -> Result<Self> {
        let modified = file_mtime(path);
        let cameras = cameras::load(path, &defaults)?;
        Ok(Self {
            current: RwLock::new(Arc::new(cameras)),
            source: Some(CatalogFile {
                path: path.to_path_buf(),
                defaults,
                modified: Mutex::new(modified),
            }),
        })
    }

    /// Fixed catalog with no backing file.
    pub fn fixed(cameras: Cameras) -> Self {
        Self {
            current: RwLock::new(Arc::new(cameras)),
            source: None,
        }
    }

    pub fn snapshot(&self) -> Arc<Cameras> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup(&self, key: &CameraKey) -> Option<CameraSource> {
        self.snapshot().lookup(key).cloned()
    }

    /// Re-read the catalog if its mtime moved.  On a parse error the
    /// previous catalog stays active and the error is returned.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(source) = &self.source else {
            return Ok(false);
        };

        let now_modified = file_mtime(&source.path);
        {
            let seen = source.modified.lock().unwrap_or_else(PoisonError::into_inner);
            if *seen == now_modified {
                return Ok(false);
            }
        }

        // Record the mtime before parsing so a broken file is reported once.
        *source.modified.lock().unwrap_or_else(PoisonError::into_inner) = now_modified;

        let cameras = cameras::load(&source.path, &source.defaults)
            .context("Camera catalog reload failed, keeping previous catalog")?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(cameras);
        info!("Camera catalog reloaded from {}", source.path.display());
        Ok(true)
    }

    /// Poll the catalog file until `shutdown` is set.
    pub fn spawn_watcher(
        self: Arc<Self>,
        every: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.tick().await;
            while !shutdown.load(Ordering::Relaxed) {
                ticker.tick().await;
                if let Err(e) = self.reload_if_changed() {
                    error!("{e:#}");
                }
            }
        })
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use filetime::{set_file_mtime, FileTime};

    use super::*;

    const ONE: &str = "[airports.kspb]\n[[airports.kspb.webcams]]\nurl = \"http://a/cam.jpg\"\n";
    const TWO: &str = "[airports.kspb]\n[[airports.kspb.webcams]]\nurl = \"http://a/cam.jpg\"\n\
                       [[airports.kspb.webcams]]\ntype = \"push\"\n";

    fn bump_mtime(path: &Path, secs_ahead: i64) {
        let t = FileTime::from_unix_time(FileTime::now().unix_seconds() + secs_ahead, 0);
        set_file_mtime(path, t).unwrap();
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cameras.toml");
        std::fs::write(&path, ONE).unwrap();

        let registry = CameraRegistry::load(&path, SourceDefaults::default()).unwrap();
        assert_eq!(registry.snapshot().camera_count(), 1);
        assert!(!registry.reload_if_changed().unwrap());

        std::fs::write(&path, TWO).unwrap();
        bump_mtime(&path, 10);
        assert!(registry.reload_if_changed().unwrap());
        assert_eq!(registry.snapshot().camera_count(), 2);
        assert!(registry.lookup(&CameraKey::new("kspb", 1).unwrap()).is_some());
    }

    #[test]
    fn test_broken_reload_keeps_previous_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cameras.toml");
        std::fs::write(&path, ONE).unwrap();
        let registry = CameraRegistry::load(&path, SourceDefaults::default()).unwrap();

        std::fs::write(&path, "[airports.kspb\nbroken").unwrap();
        bump_mtime(&path, 10);
        assert!(registry.reload_if_changed().is_err());
        assert_eq!(registry.snapshot().camera_count(), 1);

        // Reported once, not on every poll.
        assert!(!registry.reload_if_changed().unwrap());
    }

    #[test]
    fn test_fixed_catalog_never_reloads() {
        let cams = cameras::parse(ONE, &SourceDefaults::default()).unwrap();
        let registry = CameraRegistry::fixed(cams);
        assert!(!registry.reload_if_changed().unwrap());
        assert!(registry.lookup(&CameraKey::new("kspb", 0).unwrap()).is_some());
    }
}
