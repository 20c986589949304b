//! On-disk frame cache: `{cache_dir}/{airport}_{cam}.{jpg|webp}`.
//!
//! Writes go to a uniquely named temp file in the same directory and are
//! renamed over the target, so a reader opens either the previous complete
//! frame or the new one.  Timestamp and size come from the opened file's
//! own metadata; there is no separate index to drift out of sync.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use aerocam_common::key::{CameraKey, ImageFormat};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// One cached variant, read in full.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub bytes: Vec<u8>,
    /// Variant actually served (may differ from the one requested).
    pub format: ImageFormat,
    pub modified: SystemTime,
    pub size: u64,
}

impl CachedFrame {
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or(Duration::ZERO)
    }

    pub fn unix_time(&self) -> u64 {
        unix_secs(self.modified)
    }

    /// Validator derived from mtime (to the nanosecond) and size of the
    /// served file.
    pub fn etag(&self) -> String {
        let nanos = self
            .modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        format!(
            "\"{:x}.{:x}-{:x}-{}\"",
            self.unix_time(),
            nanos,
            self.size,
            self.format.extension()
        )
    }
}

pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &CameraKey, format: ImageFormat) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.stem(), format.extension()))
    }

    /// Read one variant. `Ok(None)` when it has never been written.
    pub async fn read(
        &self,
        key: &CameraKey,
        format: ImageFormat,
    ) -> io::Result<Option<CachedFrame>> {
        let path = self.path(key, format);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        // Metadata from the handle, not the path: a concurrent rename
        // cannot pair these bytes with another file's mtime.
        let meta = file.metadata().await?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut bytes).await?;

        Ok(Some(CachedFrame {
            size: bytes.len() as u64,
            bytes,
            format,
            modified: meta.modified()?,
        }))
    }

    /// Read `format`, falling back to the original JPEG when a transcoded
    /// variant is missing.
    pub async fn read_with_fallback(
        &self,
        key: &CameraKey,
        format: ImageFormat,
    ) -> io::Result<Option<CachedFrame>> {
        match self.read(key, format).await {
            Ok(Some(frame)) => return Ok(Some(frame)),
            Ok(None) => {}
            Err(e) => {
                // An unreadable variant is treated like a missing one.
                warn!(camera = %key, format = format.extension(), "Cache read failed: {e}");
                if format.fallback().is_none() {
                    return Err(e);
                }
            }
        }
        match format.fallback() {
            Some(fallback) => self.read(key, fallback).await,
            None => Ok(None),
        }
    }

    /// Modification time of a variant without reading it.
    pub async fn modified(
        &self,
        key: &CameraKey,
        format: ImageFormat,
    ) -> io::Result<Option<SystemTime>> {
        match tokio::fs::metadata(self.path(key, format)).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically replace a variant.  `captured_at` overrides the mtime
    /// (push uploads keep their upload time); `None` leaves it at "now".
    pub async fn write(
        &self,
        key: &CameraKey,
        format: ImageFormat,
        bytes: &[u8],
        captured_at: Option<SystemTime>,
    ) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.path(key, format);
        let temp = self.dir.join(format!(
            ".{}.{}.{}.{}.tmp",
            key.stem(),
            format.extension(),
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let result = write_then_rename(&temp, &target, bytes, captured_at).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result?;

        debug!(
            camera = %key,
            format = format.extension(),
            size = bytes.len(),
            "Cache updated"
        );
        Ok(())
    }

    /// Drop a single variant.  Returns whether it existed.
    pub async fn remove(&self, key: &CameraKey, format: ImageFormat) -> io::Result<bool> {
        remove_if_exists(&self.path(key, format)).await
    }

    /// Remove cached variants for one camera, or everything when `key` is
    /// `None`.  Returns the number of files removed.
    pub async fn clear(&self, key: Option<&CameraKey>) -> io::Result<usize> {
        let mut removed = 0;

        if let Some(key) = key {
            for format in [ImageFormat::Jpeg, ImageFormat::Webp] {
                if self.remove(key, format).await? {
                    removed += 1;
                }
            }
            return Ok(removed);
        }

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let is_frame = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("jpg") | Some("webp")
            );
            if is_frame && remove_if_exists(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn write_then_rename(
    temp: &Path,
    target: &Path,
    bytes: &[u8],
    captured_at: Option<SystemTime>,
) -> io::Result<()> {
    let mut file = tokio::fs::File::create(temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Some(t) = captured_at {
        filetime::set_file_mtime(temp, FileTime::from_system_time(t))?;
    }
    tokio::fs::rename(temp, target).await
}

async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
