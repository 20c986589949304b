//! Push cameras – adopt the newest frame an uploader dropped on disk.
//!
//! The SFTP/FTP server writes into `{push_dir}/{airport}_{cam}/`.  Nothing is
//! fetched over the network; the newest settled image file is read and its
//! modification time becomes the frame's capture time.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

use aerocam_common::key::CameraKey;

use crate::error::FetchError;

/// Files modified more recently than this may still be uploading.
const SETTLE_TIME: Duration = Duration::from_secs(2);

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Drop directory for one camera.
pub fn drop_dir(push_dir: &Path, key: &CameraKey) -> PathBuf {
    push_dir.join(key.stem())
}

/// Read the newest settled upload. Returns the bytes and their mtime.
pub(crate) async fn adopt(
    push_dir: &Path,
    key: &CameraKey,
) -> Result<(Vec<u8>, SystemTime), FetchError> {
    let dir = drop_dir(push_dir, key);
    let (path, modified) = newest_settled(&dir, SystemTime::now())
        .await?
        .ok_or_else(|| {
            FetchError::Process(format!("no uploaded frame in {}", dir.display()))
        })?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| FetchError::Process(format!("cannot read {}: {e}", path.display())))?;

    debug!(
        camera = %key,
        path = %path.display(),
        size = bytes.len(),
        "Adopted pushed frame"
    );
    Ok((bytes, modified))
}

/// Upload time of the frame [`adopt`] would pick, without reading it.
pub async fn newest_upload(
    push_dir: &Path,
    key: &CameraKey,
) -> Result<Option<SystemTime>, FetchError> {
    let dir = drop_dir(push_dir, key);
    Ok(newest_settled(&dir, SystemTime::now())
        .await?
        .map(|(_, modified)| modified))
}

async fn newest_settled(
    dir: &Path,
    now: SystemTime,
) -> Result<Option<(PathBuf, SystemTime)>, FetchError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(FetchError::Process(format!(
                "cannot list {}: {e}",
                dir.display()
            )))
        }
    };

    let cutoff = now.checked_sub(SETTLE_TIME).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut newest: Option<(PathBuf, SystemTime)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified > cutoff {
            // Still being written
            continue;
        }
        if newest.as_ref().map_or(true, |(_, t)| modified > *t) {
            newest = Some((path, modified));
        }
    }

    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    fn write_aged(path: &Path, bytes: &[u8], age: Duration) -> SystemTime {
        std::fs::write(path, bytes).unwrap();
        let mtime = SystemTime::now() - age;
        set_file_mtime(path, FileTime::from_system_time(mtime)).unwrap();
        mtime
    }

    #[tokio::test]
    async fn test_adopts_newest_settled_image() {
        let tmp = tempfile::tempdir().unwrap();
        let key = CameraKey::new("kspb", 2).unwrap();
        let dir = drop_dir(tmp.path(), &key);
        std::fs::create_dir_all(&dir).unwrap();

        write_aged(&dir.join("old.jpg"), b"old", Duration::from_secs(600));
        let expected = write_aged(&dir.join("new.JPG"), b"new", Duration::from_secs(30));
        write_aged(&dir.join("notes.txt"), b"txt", Duration::from_secs(5));
        // Still uploading
        std::fs::write(dir.join("partial.jpg"), b"partial").unwrap();

        let (bytes, modified) = adopt(tmp.path(), &key).await.unwrap();
        assert_eq!(bytes, b"new");
        let drift = modified
            .duration_since(expected)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_newest_upload_matches_adopted_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let key = CameraKey::new("kspb", 1).unwrap();
        let dir = drop_dir(tmp.path(), &key);
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(newest_upload(tmp.path(), &key).await.unwrap(), None);

        write_aged(&dir.join("a.jpg"), b"a", Duration::from_secs(300));
        write_aged(&dir.join("b.jpg"), b"b", Duration::from_secs(90));
        let (_, adopted) = adopt(tmp.path(), &key).await.unwrap();
        assert_eq!(newest_upload(tmp.path(), &key).await.unwrap(), Some(adopted));
    }

    #[tokio::test]
    async fn test_missing_drop_dir_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let key = CameraKey::new("kspb", 0).unwrap();
        let err = adopt(tmp.path(), &key).await.unwrap_err();
        assert_eq!(err.kind(), "process");
    }

    #[tokio::test]
    async fn test_empty_files_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let key = CameraKey::new("kspb", 0).unwrap();
        let dir = drop_dir(tmp.path(), &key);
        std::fs::create_dir_all(&dir).unwrap();
        write_aged(&dir.join("zero.jpg"), b"", Duration::from_secs(60));

        assert!(adopt(tmp.path(), &key).await.is_err());
    }
}
