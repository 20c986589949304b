//! Aerocam server – serves cached webcam frames and refreshes them in the
//! background.
//!
//! This binary:
//! 1. Reads configuration from `aerocam.conf` and the camera catalog
//! 2. Wires the cache, breaker and lock back-ends to the frame fetcher
//! 3. Runs the axum HTTP server until Ctrl-C / SIGTERM

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use aerocam_capture::SourceFetcher;
use aerocam_common::config::{self, Config};
use aerocam_web::coordinator::RefreshCoordinator;
use aerocam_web::registry::CameraRegistry;
use aerocam_web::routes::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aerocam_web=info,aerocam_capture=info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Aerocam starting (listen={}, coordination={:?})",
        config.listen_addr, config.coordination
    );

    std::fs::create_dir_all(&config.cache_dir).context("Cannot create cache directory")?;
    std::fs::create_dir_all(&config.state_dir).context("Cannot create state directory")?;

    let registry = Arc::new(
        CameraRegistry::load(&config.cameras_file, config.source_defaults())
            .context("Camera catalog load failed")?,
    );

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── wire pipeline ────────────────────────────────────────────────
    let fetcher = SourceFetcher::new(config.push_dir.clone(), config.min_frame_bytes)
        .context("Cannot build frame fetcher")?
        .with_ffmpeg(&config.ffmpeg_path);
    let coordinator = RefreshCoordinator::from_config(&config, Arc::new(fetcher))?;

    let watcher = registry.clone().spawn_watcher(
        Duration::from_secs(config.cameras_reload_secs),
        shutdown.clone(),
    );

    // ── start HTTP server ────────────────────────────────────────────
    let state = AppState::new(coordinator, registry);
    let listen_addr = config.listen_addr.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = routes::run(state, &listen_addr, shutdown).await {
            tracing::error!("HTTP server error: {e:#}");
        }
    });

    // Wait for the server task (runs until shutdown)
    let _ = server_handle.await;

    watcher.abort();
    info!("Aerocam stopped");

    Ok(())
}
