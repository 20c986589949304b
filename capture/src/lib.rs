//! Aerocam Capture – acquires one fresh frame from a webcam source.
//!
//! [`SourceFetcher`] dispatches on the camera's [`SourceKind`]:
//!
//! | kind           | how                                           | bound        |
//! |----------------|-----------------------------------------------|--------------|
//! | `rtsp`         | `ffmpeg -frames:v 1` to a pipe                | max runtime  |
//! | `mjpeg`        | HTTP stream, read until the first full JPEG   | timeout      |
//! | `static_image` | HTTP GET                                      | timeout      |
//! | `push`         | newest settled file in the drop directory     | –            |
//!
//! Every frame goes through [`validate::check_frame`].  Failures are always
//! returned as [`FetchError`] values; the caller decides what they mean for
//! the camera's circuit breaker.

mod http;
mod mjpeg;
mod rtsp;

pub mod error;
pub mod push;
pub mod validate;

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use aerocam_common::cameras::{CameraSource, SourceKind};
use aerocam_common::key::CameraKey;

pub use error::{FetchError, Severity};
pub use mjpeg::FrameScanner;
pub use validate::FrameKind;

/// One validated frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub kind: FrameKind,
    /// Upload time for push cameras; `None` means "now".
    pub captured_at: Option<SystemTime>,
}

/// Produces frames for cameras.  The refresh coordinator only talks to
/// this trait so tests can substitute a scripted source.
#[async_trait]
pub trait FrameFetcher: Send + Sync {
    async fn fetch(&self, key: &CameraKey, source: &CameraSource) -> Result<Frame, FetchError>;

    /// Capture time of the frame `fetch` would return, when it is known
    /// without fetching.  Only push uploads can answer this.
    async fn latest_capture(&self, _key: &CameraKey, _source: &CameraSource) -> Option<SystemTime> {
        None
    }
}

/// Production fetcher for all source kinds.
pub struct SourceFetcher {
    client: reqwest::Client,
    push_dir: PathBuf,
    min_frame_bytes: usize,
    ffmpeg: PathBuf,
}

impl SourceFetcher {
    pub fn new(push_dir: PathBuf, min_frame_bytes: usize) -> Result<Self, FetchError> {
        // Per-request timeouts come from each camera's descriptor.
        let client = reqwest::Client::builder()
            .user_agent(concat!("aerocam/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Process(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            push_dir,
            min_frame_bytes,
            ffmpeg: PathBuf::from("ffmpeg"),
        })
    }

    /// Use another ffmpeg binary for RTSP sources.
    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }
}

#[async_trait]
impl FrameFetcher for SourceFetcher {
    async fn fetch(&self, key: &CameraKey, source: &CameraSource) -> Result<Frame, FetchError> {
        let (bytes, captured_at) = match source.kind {
            SourceKind::Rtsp => (rtsp::grab(&self.ffmpeg, source).await?, None),
            SourceKind::Mjpeg => (mjpeg::grab(&self.client, source).await?, None),
            SourceKind::StaticImage => (http::get(&self.client, source).await?, None),
            SourceKind::Push => {
                let (bytes, modified) = push::adopt(&self.push_dir, key).await?;
                (bytes, Some(modified))
            }
        };

        let kind = validate::check_frame(&bytes, self.min_frame_bytes)?;
        debug!(
            camera = %key,
            source = source.kind.as_str(),
            size = bytes.len(),
            "Frame fetched"
        );
        Ok(Frame {
            bytes,
            kind,
            captured_at,
        })
    }

    async fn latest_capture(&self, key: &CameraKey, source: &CameraSource) -> Option<SystemTime> {
        if source.kind != SourceKind::Push {
            return None;
        }
        push::newest_upload(&self.push_dir, key).await.ok().flatten()
    }
}
