//! Camera identity and image format variants.
//!
//! Every piece of per-camera state (cache files, lock files, breaker
//! records, push drop directories) is named after a [`CameraKey`] stem such
//! as `kspb_0`, so the key is validated strictly before it ever reaches a
//! filesystem path.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one webcam: an airport id plus the 0-based camera index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraKey {
    pub airport: String,
    pub cam: usize,
}

impl CameraKey {
    /// Build a key from raw request/config values.
    ///
    /// Airport ids are case-insensitive and must be 2..=8 ASCII
    /// alphanumerics; anything else yields `None`.
    pub fn new(airport: &str, cam: usize) -> Option<Self> {
        let airport = airport.trim().to_ascii_lowercase();
        if !is_valid_airport_id(&airport) {
            return None;
        }
        Some(CameraKey { airport, cam })
    }

    /// Parse both parts from query-string values.
    pub fn parse(airport: &str, cam: &str) -> Option<Self> {
        let cam = cam.trim().parse::<usize>().ok()?;
        Self::new(airport, cam)
    }

    /// File-name stem shared by every per-camera file: `{airport}_{cam}`.
    pub fn stem(&self) -> String {
        format!("{}_{}", self.airport, self.cam)
    }
}

impl fmt::Display for CameraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.airport, self.cam)
    }
}

/// Airport ids double as file-name components.
pub fn is_valid_airport_id(id: &str) -> bool {
    (2..=8).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Encoding variant of a cached frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Webp,
}

impl ImageFormat {
    /// Parse the `fmt` query parameter. Unknown or missing values mean JPEG.
    pub fn from_param(param: Option<&str>) -> Self {
        match param.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
            Some("webp") => ImageFormat::Webp,
            _ => ImageFormat::Jpeg,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    /// Variant to serve when this one has not been produced.
    pub fn fallback(&self) -> Option<ImageFormat> {
        match self {
            ImageFormat::Jpeg => None,
            ImageFormat::Webp => Some(ImageFormat::Jpeg),
        }
    }
}
