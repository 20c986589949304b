//! Acceptance checks applied to every fetched frame.

use crate::error::FetchError;

/// Image container detected from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Jpeg,
    Png,
    Webp,
}

impl FrameKind {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 3 && bytes[..3] == [0xFF, 0xD8, 0xFF] {
            Some(FrameKind::Jpeg)
        } else if bytes.len() >= 8 && bytes[..8] == *b"\x89PNG\r\n\x1a\n" {
            Some(FrameKind::Png)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(FrameKind::Webp)
        } else {
            None
        }
    }
}

/// Reject frames under `min_bytes` or that are not a known image container.
pub fn check_frame(bytes: &[u8], min_bytes: usize) -> Result<FrameKind, FetchError> {
    if bytes.len() < min_bytes {
        return Err(FetchError::TooSmall {
            size: bytes.len(),
            min: min_bytes,
        });
    }
    FrameKind::sniff(bytes)
        .ok_or_else(|| FetchError::Process("response is not a JPEG, PNG or WebP image".into()))
}
