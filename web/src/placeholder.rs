//! Image served when a camera has nothing cached and nothing can be fetched.

use std::path::Path;

use anyhow::{Context, Result};
use axum::body::Bytes;
use image::{DynamicImage, Rgb, RgbImage};
use tracing::{info, warn};

use aerocam_common::key::ImageFormat;

use crate::transcode::{encode_jpeg, encode_webp};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const GREY: Rgb<u8> = Rgb([0x80, 0x80, 0x80]);

/// Pre-encoded placeholder variants.
#[derive(Debug, Clone)]
pub struct Placeholder {
    jpeg: Bytes,
    webp: Option<Bytes>,
}

impl Placeholder {
    /// Use the configured image if it decodes, otherwise the generated
    /// grey frame.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            match Self::from_file(path) {
                Ok(placeholder) => {
                    info!("Using placeholder image {}", path.display());
                    return Ok(placeholder);
                }
                Err(e) => warn!("Placeholder image unusable, generating one: {e:#}"),
            }
        }
        Self::generated()
    }

    pub fn generated() -> Result<Self> {
        Self::from_image(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
            WIDTH, HEIGHT, GREY,
        )))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let img = image::load_from_memory(&bytes)
            .with_context(|| format!("Cannot decode {}", path.display()))?;
        Self::from_image(&img)
    }

    fn from_image(img: &DynamicImage) -> Result<Self> {
        let jpeg = encode_jpeg(img)?;
        let webp = match encode_webp(img) {
            Ok(webp) => Some(Bytes::from(webp)),
            Err(e) => {
                warn!("WebP placeholder unavailable: {e:#}");
                None
            }
        };
        Ok(Self {
            jpeg: Bytes::from(jpeg),
            webp,
        })
    }

    /// Bytes for the requested format and the format they are actually in.
    pub fn variant(&self, format: ImageFormat) -> (ImageFormat, Bytes) {
        match (format, &self.webp) {
            (ImageFormat::Webp, Some(webp)) => (ImageFormat::Webp, webp.clone()),
            _ => (ImageFormat::Jpeg, self.jpeg.clone()),
        }
    }
}
