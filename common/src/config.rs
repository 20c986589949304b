//! Configuration parsing – reads a KEY=VALUE file (`aerocam.conf`).
//!
//! The per-camera source list lives in a separate TOML catalog, see
//! [`crate::cameras`]; this file only carries service-wide settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::cameras::SourceDefaults;

/// Where refresh locks and circuit-breaker records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coordination {
    /// Files under `state_dir`; safe for several processes sharing a disk.
    File,
    /// In-process maps; only valid for a single server instance.
    Memory,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── network ──────────────────────────────────────────────────────
    pub listen_addr: String,

    // ── storage ──────────────────────────────────────────────────────
    pub cameras_file: PathBuf,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Root of the per-camera push drop directories.
    pub push_dir: PathBuf,
    pub coordination: Coordination,
    /// ffmpeg binary used for RTSP grabs.
    pub ffmpeg_path: PathBuf,

    // ── per-camera defaults ──────────────────────────────────────────
    pub default_refresh_secs: u64,
    pub default_timeout_secs: u64,
    pub default_max_runtime_secs: u64,

    // ── refresh pipeline ─────────────────────────────────────────────
    /// Frames smaller than this are rejected as failed fetches.
    pub min_frame_bytes: usize,
    /// A refresh lock older than this is treated as abandoned.
    pub lock_stale_secs: u64,
    pub breaker_base_secs: u64,
    pub breaker_max_secs: u64,
    pub transcode_webp: bool,
    pub cameras_reload_secs: u64,
    pub placeholder_image: Option<PathBuf>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/aerocam/aerocam.conf"
    }

    pub fn source_defaults(&self) -> SourceDefaults {
        SourceDefaults {
            refresh_interval: Duration::from_secs(self.default_refresh_secs.max(1)),
            timeout: Duration::from_secs(self.default_timeout_secs.max(1)),
            max_runtime: Duration::from_secs(self.default_max_runtime_secs.max(1)),
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str, default: bool| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(default)
    };

    let coordination = match get("COORDINATION").as_deref() {
        Some(v) if v.eq_ignore_ascii_case("memory") => Coordination::Memory,
        _ => Coordination::File,
    };

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into()),

        cameras_file: PathBuf::from(
            get("CAMERAS_FILE").unwrap_or_else(|| "/etc/aerocam/cameras.toml".into()),
        ),
        cache_dir: PathBuf::from(
            get("CACHE_DIR").unwrap_or_else(|| "/var/cache/aerocam/webcams".into()),
        ),
        state_dir: PathBuf::from(
            get("STATE_DIR").unwrap_or_else(|| "/var/cache/aerocam/state".into()),
        ),
        push_dir: PathBuf::from(
            get("PUSH_DIR").unwrap_or_else(|| "/var/lib/aerocam/uploads".into()),
        ),
        coordination,
        ffmpeg_path: PathBuf::from(get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".into())),

        default_refresh_secs: get_u64("DEFAULT_REFRESH_SECS", 60),
        default_timeout_secs: get_u64("DEFAULT_TIMEOUT_SECS", 10),
        default_max_runtime_secs: get_u64("DEFAULT_MAX_RUNTIME_SECS", 15),

        min_frame_bytes: get_u64("MIN_FRAME_BYTES", 1024) as usize,
        lock_stale_secs: get_u64("LOCK_STALE_SECS", 300),
        breaker_base_secs: get_u64("BREAKER_BASE_SECS", 60),
        breaker_max_secs: get_u64("BREAKER_MAX_SECS", 3600),
        transcode_webp: get_bool("TRANSCODE_WEBP", true),
        cameras_reload_secs: get_u64("CAMERAS_RELOAD_SECS", 30),
        placeholder_image: get("PLACEHOLDER_IMAGE").map(PathBuf::from),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
LISTEN_ADDR=127.0.0.1:9090
CACHE_DIR="/srv/cache"
COORDINATION=memory
"#;
        let map = parse_conf(text);
        assert_eq!(map["LISTEN_ADDR"], "127.0.0.1:9090");
        assert_eq!(map["CACHE_DIR"], "/srv/cache");
        assert_eq!(map["COORDINATION"], "memory");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.coordination, Coordination::File);
        assert_eq!(config.min_frame_bytes, 1024);
        assert_eq!(config.lock_stale_after(), Duration::from_secs(300));
        assert!(config.transcode_webp);
        assert!(config.placeholder_image.is_none());
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(
            config.source_defaults().refresh_interval,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aerocam.conf");
        std::fs::write(
            &path,
            "STATE_DIR=/tmp/aerocam-state\nTRANSCODE_WEBP=0\nDEFAULT_REFRESH_SECS=120\n\
             MIN_FRAME_BYTES=not-a-number\nPLACEHOLDER_IMAGE=\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/aerocam-state"));
        assert!(!config.transcode_webp);
        assert_eq!(config.default_refresh_secs, 120);
        assert_eq!(config.min_frame_bytes, 1024);
        assert!(config.placeholder_image.is_none());
    }
}
