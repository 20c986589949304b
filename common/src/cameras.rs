//! Camera catalog – per-airport webcam source descriptors.
//!
//! The catalog lives in a TOML file next to `aerocam.conf`:
//!
//! ```toml
//! [airports.kspb]
//! name = "Scappoose Industrial Airpark"
//!
//! [[airports.kspb.webcams]]
//! name = "Runway 15"
//! url = "rtsp://10.0.0.20:554/stream1"
//! rtsp_transport = "tcp"
//! refresh_seconds = 60
//!
//! [[airports.kspb.webcams]]
//! name = "Ramp"
//! type = "push"
//! ```
//!
//! The camera index used in URLs and file names is the 0-based position of
//! the entry in `webcams`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::key::{is_valid_airport_id, CameraKey};

/// How a frame is acquired from a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One-frame grab through ffmpeg (`rtsp://` and `rtsps://`).
    Rtsp,
    /// Read until the first complete JPEG of a multipart stream.
    Mjpeg,
    /// Plain HTTP GET of a still image.
    StaticImage,
    /// Frames uploaded by the camera over SFTP/FTP into a drop directory.
    Push,
}

impl SourceKind {
    /// Guess the kind from the URL when the catalog does not say.
    pub fn infer(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if lower.contains("mjpg") || lower.contains("mjpeg") {
            SourceKind::Mjpeg
        } else {
            SourceKind::StaticImage
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rtsp => "rtsp",
            SourceKind::Mjpeg => "mjpeg",
            SourceKind::StaticImage => "static_image",
            SourceKind::Push => "push",
        }
    }
}

/// RTSP lower transport handed to ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

/// Static per-camera descriptor. Read-only once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSource {
    pub name: String,
    /// Empty for push cameras.
    pub url: String,
    pub kind: SourceKind,
    pub transport: RtspTransport,
    /// Connect/read timeout for a single fetch.
    pub timeout: Duration,
    /// Hard wall-clock ceiling for an ffmpeg grab.
    pub max_runtime: Duration,
    /// A cached frame younger than this is served without refreshing.
    pub refresh_interval: Duration,
}

/// One airport and its webcams, in catalog order.
#[derive(Debug, Clone)]
pub struct Airport {
    pub id: String,
    pub name: String,
    pub cameras: Vec<CameraSource>,
}

/// Fallback values for webcam entries that omit them.
#[derive(Debug, Clone, Copy)]
pub struct SourceDefaults {
    pub refresh_interval: Duration,
    pub timeout: Duration,
    pub max_runtime: Duration,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            max_runtime: Duration::from_secs(15),
        }
    }
}

/// The loaded catalog.
#[derive(Debug, Clone, Default)]
pub struct Cameras {
    airports: BTreeMap<String, Airport>,
}

impl Cameras {
    pub fn lookup(&self, key: &CameraKey) -> Option<&CameraSource> {
        self.airports.get(&key.airport)?.cameras.get(key.cam)
    }

    pub fn airport(&self, id: &str) -> Option<&Airport> {
        self.airports.get(id)
    }

    pub fn airports(&self) -> impl Iterator<Item = &Airport> {
        self.airports.values()
    }

    /// Every configured camera with its key.
    pub fn iter(&self) -> impl Iterator<Item = (CameraKey, &CameraSource)> {
        self.airports.values().flat_map(|a| {
            a.cameras.iter().enumerate().map(move |(i, cam)| {
                (
                    CameraKey {
                        airport: a.id.clone(),
                        cam: i,
                    },
                    cam,
                )
            })
        })
    }

    pub fn camera_count(&self) -> usize {
        self.airports.values().map(|a| a.cameras.len()).sum()
    }
}

// ── file format ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    airports: BTreeMap<String, AirportEntry>,
}

#[derive(Debug, Deserialize)]
struct AirportEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    webcams: Vec<WebcamEntry>,
}

#[derive(Debug, Deserialize)]
struct WebcamEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<SourceKind>,
    #[serde(default)]
    rtsp_transport: Option<RtspTransport>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    max_runtime_seconds: Option<u64>,
    #[serde(default)]
    refresh_seconds: Option<u64>,
}

/// Read and validate the catalog file.
pub fn load(path: &Path, defaults: &SourceDefaults) -> Result<Cameras> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read camera catalog: {}", path.display()))?;
    let cameras =
        parse(&text, defaults).with_context(|| format!("Invalid catalog {}", path.display()))?;
    info!(
        "Loaded {} camera(s) across {} airport(s) from {}",
        cameras.camera_count(),
        cameras.airports.len(),
        path.display()
    );
    Ok(cameras)
}

/// Parse catalog text. Airport ids are lower-cased.
pub fn parse(text: &str, defaults: &SourceDefaults) -> Result<Cameras> {
    let file: CatalogFile = toml::from_str(text).context("Malformed TOML")?;

    let mut airports = BTreeMap::new();
    for (raw_id, entry) in file.airports {
        let id = raw_id.to_ascii_lowercase();
        if !is_valid_airport_id(&id) {
            anyhow::bail!("Invalid airport id '{raw_id}' (2-8 alphanumeric characters)");
        }

        let mut cameras = Vec::with_capacity(entry.webcams.len());
        for (i, cam) in entry.webcams.into_iter().enumerate() {
            let source = resolve_webcam(cam, defaults)
                .with_context(|| format!("airport '{id}' webcam #{i}"))?;
            cameras.push(source);
        }

        let name = entry.name.unwrap_or_else(|| id.to_ascii_uppercase());
        airports.insert(id.clone(), Airport { id, name, cameras });
    }

    Ok(Cameras { airports })
}

fn resolve_webcam(entry: WebcamEntry, defaults: &SourceDefaults) -> Result<CameraSource> {
    let url = entry.url.unwrap_or_default().trim().to_string();
    let kind = match entry.kind {
        Some(kind) => kind,
        None if url.is_empty() => anyhow::bail!("missing 'url' (or type = \"push\")"),
        None => SourceKind::infer(&url),
    };
    if kind != SourceKind::Push && url.is_empty() {
        anyhow::bail!("'{}' source needs a 'url'", kind.as_str());
    }

    let secs = |v: Option<u64>, default: Duration| -> Duration {
        v.map(|s| Duration::from_secs(s.max(1))).unwrap_or(default)
    };

    Ok(CameraSource {
        name: entry.name.unwrap_or_default(),
        url,
        kind,
        transport: entry.rtsp_transport.unwrap_or_default(),
        timeout: secs(entry.timeout_seconds, defaults.timeout),
        max_runtime: secs(entry.max_runtime_seconds, defaults.max_runtime),
        refresh_interval: secs(entry.refresh_seconds, defaults.refresh_interval),
    })
}
