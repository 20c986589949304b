//! RTSP/RTSPS frame grab – spawns `ffmpeg` for exactly one frame.
//!
//! Two independent bounds apply: ffmpeg's own socket `-timeout` (connect and
//! read) and a wall-clock `max_runtime` enforced here.  When the wall clock
//! fires the child is dropped and `kill_on_drop` SIGKILLs it, so a hung
//! camera never leaves a stray ffmpeg behind.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use aerocam_common::cameras::CameraSource;

use crate::error::FetchError;

/// Build the ffmpeg argument list for a one-frame JPEG grab to stdout.
pub(crate) fn ffmpeg_args(source: &CameraSource) -> Vec<String> {
    let socket_timeout_us = source.timeout.as_micros().to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-rtsp_transport",
        source.transport.as_str(),
        "-timeout",
        socket_timeout_us.as_str(),
        "-i",
        source.url.as_str(),
        "-frames:v",
        "1",
        "-f",
        "image2pipe",
        "-vcodec",
        "mjpeg",
        "-q:v",
        "2",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Grab one JPEG frame from an RTSP source.
pub(crate) async fn grab(ffmpeg: &Path, source: &CameraSource) -> Result<Vec<u8>, FetchError> {
    let child = Command::new(ffmpeg)
        .args(ffmpeg_args(source))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            FetchError::Process(format!("cannot spawn {}: {e}", ffmpeg.display()))
        })?;

    debug!(pid = child.id(), "ffmpeg started for one-frame grab");

    let output = match tokio::time::timeout(source.max_runtime, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(FetchError::Process(format!("ffmpeg wait failed: {e}"))),
        Err(_) => {
            warn!(
                max_runtime_secs = source.max_runtime.as_secs(),
                "ffmpeg exceeded max runtime, killed"
            );
            return Err(FetchError::Timeout(source.max_runtime));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_stderr(stderr.trim(), &output.status.to_string()));
    }
    if output.stdout.is_empty() {
        return Err(FetchError::Process("ffmpeg produced no frame".into()));
    }
    Ok(output.stdout)
}

/// Turn a failed ffmpeg run into the matching error kind.
pub(crate) fn classify_stderr(stderr: &str, status: &str) -> FetchError {
    let lower = stderr.to_ascii_lowercase();
    let detail = if stderr.is_empty() {
        format!("ffmpeg {status}")
    } else {
        // ffmpeg repeats itself; the last line is the useful one.
        stderr.lines().last().unwrap_or(stderr).to_string()
    };

    const NETWORK: [&str; 7] = [
        "connection refused",
        "no route to host",
        "network is unreachable",
        "name or service not known",
        "temporary failure in name resolution",
        "failed to resolve hostname",
        "connection timed out",
    ];
    const AUTH: [&str; 3] = ["401 unauthorized", "403 forbidden", "unauthorized"];

    if AUTH.iter().any(|p| lower.contains(p)) {
        FetchError::AuthFailure(detail)
    } else if NETWORK.iter().any(|p| lower.contains(p)) {
        FetchError::NetworkUnreachable(detail)
    } else {
        FetchError::Process(detail)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use aerocam_common::cameras::{RtspTransport, SourceKind};

    use super::*;

    fn source(transport: RtspTransport) -> CameraSource {
        CameraSource {
            name: "rwy".into(),
            url: "rtsp://10.0.0.20:554/stream1".into(),
            kind: SourceKind::Rtsp,
            transport,
            timeout: Duration::from_secs(10),
            max_runtime: Duration::from_secs(15),
            refresh_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = ffmpeg_args(&source(RtspTransport::Udp));
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport udp"));
        assert!(joined.contains("-timeout 10000000"));
        assert!(joined.contains("-i rtsp://10.0.0.20:554/stream1"));
        assert!(joined.contains("-frames:v 1"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_classify_network() {
        let e = classify_stderr(
            "[tcp @ 0x5581] Connection to tcp://10.0.0.20:554 failed: Connection refused",
            "exit status: 1",
        );
        assert_eq!(e.kind(), "network_unreachable");

        let e = classify_stderr("Failed to resolve hostname cam.invalid", "exit status: 1");
        assert_eq!(e.kind(), "network_unreachable");
    }

    #[test]
    fn test_classify_auth() {
        let e = classify_stderr(
            "[rtsp @ 0x55] method DESCRIBE failed: 401 Unauthorized",
            "exit status: 1",
        );
        assert_eq!(e.kind(), "auth_failure");
    }

    #[test]
    fn test_classify_other() {
        let e = classify_stderr("Invalid data found when processing input", "exit status: 1");
        assert_eq!(
            e,
            FetchError::Process("Invalid data found when processing input".into())
        );

        let e = classify_stderr("", "exit status: 69");
        assert_eq!(e, FetchError::Process("ffmpeg exit status: 69".into()));
    }

    // ── grab against stand-in ffmpeg binaries ────────────────────────────

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_grab_hung_ffmpeg_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(tmp.path(), "exec sleep 30");
        let mut src = source(RtspTransport::Tcp);
        src.max_runtime = Duration::from_millis(500);

        let started = std::time::Instant::now();
        let err = grab(&ffmpeg, &src).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout(Duration::from_millis(500)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_grab_nonzero_exit_is_classified() {
        let tmp = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(
            tmp.path(),
            "echo 'Connection to tcp://10.0.0.20:554 failed: Connection refused' >&2\nexit 1",
        );

        let err = grab(&ffmpeg, &source(RtspTransport::Tcp)).await.unwrap_err();
        assert_eq!(err.kind(), "network_unreachable");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_grab_returns_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(tmp.path(), "printf 'frame-bytes'");

        let bytes = grab(&ffmpeg, &source(RtspTransport::Tcp)).await.unwrap();
        assert_eq!(bytes, b"frame-bytes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_grab_empty_stdout_is_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(tmp.path(), "exit 0");

        let err = grab(&ffmpeg, &source(RtspTransport::Tcp)).await.unwrap_err();
        assert_eq!(err.kind(), "process");
    }

    #[tokio::test]
    async fn test_grab_missing_binary_is_process_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("no-such-ffmpeg");

        let err = grab(&missing, &source(RtspTransport::Tcp)).await.unwrap_err();
        assert_eq!(err.kind(), "process");
    }
}
