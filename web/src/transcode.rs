//! Format variants for cached frames.
//!
//! Decoding and encoding are CPU-bound and run on the blocking pool.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::DynamicImage;

use aerocam_capture::FrameKind;

const JPEG_QUALITY: u8 = 85;

/// The JPEG original for a fetched frame.  JPEG input passes through
/// untouched; PNG/WebP uploads are re-encoded.
pub async fn to_jpeg(bytes: Vec<u8>, kind: FrameKind) -> Result<Vec<u8>> {
    if kind == FrameKind::Jpeg {
        return Ok(bytes);
    }
    tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory(&bytes).context("Cannot decode frame")?;
        encode_jpeg(&img)
    })
    .await
    .context("JPEG transcode task failed")?
}

/// Lossless WebP variant of a JPEG original.
pub async fn to_webp(jpeg: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory(&jpeg).context("Cannot decode frame")?;
        encode_webp(&img)
    })
    .await
    .context("WebP transcode task failed")?
}

pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode_image(&rgb).context("JPEG encode failed")?;
    Ok(out)
}

pub fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    rgb.write_with_encoder(WebPEncoder::new_lossless(&mut out))
        .context("WebP encode failed")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sample() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(32, 24, |x, y| {
            Rgb([(x * 8) as u8, (y * 10) as u8, 128])
        }))
    }

    #[tokio::test]
    async fn test_jpeg_passes_through() {
        let jpeg = encode_jpeg(&sample()).unwrap();
        let out = to_jpeg(jpeg.clone(), FrameKind::Jpeg).await.unwrap();
        assert_eq!(out, jpeg);
    }

    #[tokio::test]
    async fn test_png_becomes_jpeg() {
        let mut png = Vec::new();
        sample()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let out = to_jpeg(png, FrameKind::Png).await.unwrap();
        assert_eq!(FrameKind::sniff(&out), Some(FrameKind::Jpeg));
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[tokio::test]
    async fn test_webp_variant() {
        let jpeg = encode_jpeg(&sample()).unwrap();
        let webp = to_webp(jpeg).await.unwrap();
        assert_eq!(FrameKind::sniff(&webp), Some(FrameKind::Webp));
    }

    #[tokio::test]
    async fn test_garbage_is_an_error() {
        assert!(to_webp(b"definitely not an image".to_vec()).await.is_err());
    }
}
