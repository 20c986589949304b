//! MJPEG stream grab – read just far enough to get one complete JPEG.
//!
//! A multipart part's `Content-Length` is used when the camera sends one.
//! Otherwise the JPEG itself is parsed: marker segments between SOI and SOS
//! are skipped by their declared length, so an EXIF thumbnail (a whole
//! JPEG inside APP1) cannot end the frame early, and EOI is only searched
//! for in the entropy-coded data.  Works for `multipart/x-mixed-replace`
//! as well as raw concatenated JPEG streams.

use tracing::debug;

use aerocam_common::cameras::CameraSource;

use crate::error::FetchError;

/// Give up if this much data arrives without a complete frame.
const MAX_SCAN_BYTES: usize = 8 * 1024 * 1024;

/// Part headers kept while waiting for SOI.
const HEADER_KEEP: usize = 1024;

/// Incremental search for the first complete JPEG in a byte stream.
#[derive(Debug, Default)]
pub struct FrameScanner {
    /// Everything from SOI on once `started`, otherwise the header tail.
    buf: Vec<u8>,
    started: bool,
    /// Length from the part's `Content-Length` header.
    announced: Option<usize>,
    /// Where parsing resumes.
    pos: usize,
    /// Inside entropy-coded data (after SOS).
    in_scan: bool,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed the next chunk.  Returns the first complete frame once seen.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        if !self.started && !self.find_soi() {
            return None;
        }
        let end = match self.announced {
            Some(len) => (self.buf.len() >= len).then_some(len)?,
            None => self.walk()?,
        };
        Some(self.buf[..end].to_vec())
    }

    /// Look for SOI; on success the buffer starts at it.
    fn find_soi(&mut self) -> bool {
        // Resume one byte early: the marker may straddle two chunks.
        let from = self.pos.saturating_sub(1);
        let found = self.buf[from..]
            .windows(2)
            .position(|w| w[0] == 0xFF && w[1] == 0xD8)
            .map(|i| from + i);

        match found {
            Some(soi) => {
                self.announced = announced_length(&self.buf[..soi]);
                self.buf.drain(..soi);
                self.started = true;
                self.pos = 2;
                true
            }
            None => {
                // Keep only the tail, which may hold the part headers.
                if self.buf.len() > HEADER_KEEP {
                    let excess = self.buf.len() - HEADER_KEEP;
                    self.buf.drain(..excess);
                }
                self.pos = self.buf.len();
                false
            }
        }
    }

    /// Walk the JPEG from `pos`.  Returns the end offset once EOI is seen.
    fn walk(&mut self) -> Option<usize> {
        loop {
            if self.in_scan {
                let mut i = self.pos;
                loop {
                    if i + 1 >= self.buf.len() {
                        self.pos = i;
                        return None;
                    }
                    if self.buf[i] != 0xFF {
                        i += 1;
                        continue;
                    }
                    match self.buf[i + 1] {
                        // Stuffed byte or restart marker: still scan data.
                        0x00 | 0xD0..=0xD7 => i += 2,
                        0xFF => i += 1,
                        0xD9 => return Some(i + 2),
                        // Progressive JPEGs put tables and further SOS here.
                        _ => {
                            self.pos = i;
                            self.in_scan = false;
                            break;
                        }
                    }
                }
            }

            let i = self.pos;
            if i + 1 >= self.buf.len() {
                return None;
            }
            if self.buf[i] != 0xFF {
                // Segment lengths did not line up; fall back to scanning.
                self.in_scan = true;
                continue;
            }
            match self.buf[i + 1] {
                0xFF => self.pos += 1,
                0xD9 => return Some(i + 2),
                0x01 | 0xD0..=0xD8 => self.pos += 2,
                marker => {
                    if i + 3 >= self.buf.len() {
                        return None;
                    }
                    let len = u16::from_be_bytes([self.buf[i + 2], self.buf[i + 3]]) as usize;
                    if len < 2 {
                        self.pos = i + 2;
                        self.in_scan = true;
                        continue;
                    }
                    self.pos = i + 2 + len;
                    if marker == 0xDA {
                        self.in_scan = true;
                    }
                }
            }
        }
    }
}

/// `Content-Length` of the part whose headers end right before SOI.
fn announced_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers)
        .lines()
        .rev()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.trim().eq_ignore_ascii_case("content-length") {
                return None;
            }
            value.trim().parse::<usize>().ok()
        })
        .filter(|&len| len >= 4)
}

/// Open the stream, read until one frame is complete, then hang up.
pub(crate) async fn grab(
    client: &reqwest::Client,
    source: &CameraSource,
) -> Result<Vec<u8>, FetchError> {
    tokio::time::timeout(source.timeout, read_first_frame(client, source))
        .await
        .map_err(|_| FetchError::Timeout(source.timeout))?
}

async fn read_first_frame(
    client: &reqwest::Client,
    source: &CameraSource,
) -> Result<Vec<u8>, FetchError> {
    let mut resp = client
        .get(&source.url)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(&e, source.timeout))?;

    if !resp.status().is_success() {
        return Err(FetchError::from_status(resp.status().as_u16()));
    }

    let mut scanner = FrameScanner::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| FetchError::from_reqwest(&e, source.timeout))?
    {
        if let Some(frame) = scanner.push(&chunk) {
            debug!(size = frame.len(), "MJPEG frame complete");
            // Dropping `resp` closes the connection.
            return Ok(frame);
        }
        if scanner.buffered() > MAX_SCAN_BYTES {
            return Err(FetchError::Process(format!(
                "no complete JPEG frame within {MAX_SCAN_BYTES} bytes"
            )));
        }
    }

    Err(FetchError::Process(
        "stream ended before a complete JPEG frame".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SOI, APP0, SOS header, scan data, EOI.
    fn jpeg(scan: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
        v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00]);
        v.extend_from_slice(scan);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    /// A frame whose APP1 segment carries a complete thumbnail JPEG.
    fn jpeg_with_thumbnail() -> Vec<u8> {
        let thumb = jpeg(b"tiny");
        let mut app1 = b"Exif\0\0".to_vec();
        app1.extend_from_slice(&thumb);
        let len = (app1.len() + 2) as u16;

        let mut v = vec![0xFF, 0xD8, 0xFF, 0xE1];
        v.extend_from_slice(&len.to_be_bytes());
        v.extend_from_slice(&app1);
        v.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x05, 0x00, 0x01, 0x02]);
        v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00]);
        v.extend_from_slice(b"main-scan-data");
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    fn feed_bytewise(stream: &[u8]) -> Option<Vec<u8>> {
        let mut scanner = FrameScanner::new();
        stream
            .iter()
            .find_map(|b| scanner.push(std::slice::from_ref(b)))
    }

    #[test]
    fn test_single_chunk_multipart() {
        let frame = jpeg(b"first");
        let mut stream = b"--myboundary\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(b"\r\n--myboundary\r\n");
        stream.extend_from_slice(&jpeg(b"second"));

        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(&stream), Some(frame));
    }

    #[test]
    fn test_markers_split_across_chunks() {
        let frame = jpeg(b"payload-bytes");
        let mut stream = b"--b\r\n\r\n".to_vec();
        stream.extend_from_slice(&frame);

        // One byte at a time so every marker straddles a boundary.
        assert_eq!(feed_bytewise(&stream), Some(frame));
    }

    #[test]
    fn test_exif_thumbnail_does_not_end_frame() {
        let frame = jpeg_with_thumbnail();
        let mut stream = b"--b\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(b"\r\n--b\r\n");

        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(&stream), Some(frame.clone()));
        assert_eq!(feed_bytewise(&stream), Some(frame));
    }

    #[test]
    fn test_stuffed_bytes_and_restarts_stay_in_scan() {
        let frame = jpeg(&[0x10, 0xFF, 0x00, 0x20, 0xFF, 0xD0, 0x30, 0xFF, 0xFF, 0xD7]);
        assert_eq!(FrameScanner::new().push(&frame), Some(frame));
    }

    #[test]
    fn test_progressive_tables_between_scans() {
        let mut frame = jpeg(b"first-scan");
        frame.truncate(frame.len() - 2);
        frame.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x04, 0xFF, 0xD9]);
        frame.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02]);
        frame.extend_from_slice(b"second-scan");
        frame.extend_from_slice(&[0xFF, 0xD9]);

        assert_eq!(FrameScanner::new().push(&frame), Some(frame.clone()));
    }

    #[test]
    fn test_content_length_is_honoured() {
        // Without the header the APP1 length would run past the part.
        let mut frame = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x7F, 0xFF];
        frame.extend_from_slice(&[0xAA; 32]);
        frame.extend_from_slice(&[0xFF, 0xD9]);

        let mut stream =
            format!("--b\r\nContent-Type: image/jpeg\r\ncontent-length: {}\r\n\r\n", frame.len())
                .into_bytes();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(b"\r\n--b\r\n");

        assert_eq!(feed_bytewise(&stream), Some(frame));
    }

    #[test]
    fn test_incomplete_frame_returns_none() {
        let frame = jpeg(&[1, 2, 3, 4, 5]);
        let (head, tail) = frame.split_at(frame.len() - 1);

        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(head), None);
        assert_eq!(scanner.push(tail), Some(frame.clone()));
    }

    #[test]
    fn test_garbage_before_soi_is_not_buffered() {
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(&[b'x'; 64 * 1024]), None);
        assert!(scanner.buffered() <= HEADER_KEEP);
    }

    #[test]
    fn test_announced_length() {
        assert_eq!(
            announced_length(b"--b\r\nContent-Type: image/jpeg\r\nContent-Length: 2048\r\n\r\n"),
            Some(2048)
        );
        assert_eq!(announced_length(b"--b\r\nContent-Type: image/jpeg\r\n\r\n"), None);
        assert_eq!(announced_length(b"Content-Length: nope\r\n"), None);
    }
}
