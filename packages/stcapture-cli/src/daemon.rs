//! Live capture mode
//!
//! Runs two independent timers until interrupted:
//! - Captures an image every few seconds (first capture immediately)
//! - Refreshes the access token on a long period
//!
//! Handles graceful shutdown via SIGTERM/SIGINT.

use anyhow::Result;
use stcapture_core::{Agent, DeviceTarget};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run live capture until Ctrl+C or SIGTERM
pub async fn run_live(agent: &Agent, device: DeviceTarget, period: Duration) -> Result<()> {
    tracing::info!(
        "Starting live capture from {} every {}s, refreshing token every {}h",
        device.device_id,
        period.as_secs(),
        agent.config.refresh.interval_hours
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let capture = agent.scheduler.start_live_capture(device, period);
    let refresh = agent
        .scheduler
        .start_token_refresh(agent.config.refresh.interval());

    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                shutdown.cancelled().await;
            }
        },
    }

    capture.cancel();
    refresh.cancel();
    let capture_name = capture.name();
    let refresh_name = refresh.name();
    let stats = capture.shutdown().await;
    let refresh_stats = refresh.shutdown().await;

    tracing::info!(
        "{} stopped: {} captured, {} failed, {} ticks skipped",
        capture_name,
        stats.completed,
        stats.failed,
        stats.skipped
    );
    tracing::info!(
        "{} stopped: {} refreshed, {} failed",
        refresh_name,
        refresh_stats.completed,
        refresh_stats.failed
    );
    Ok(())
}

/// Set up the SIGTERM handler for graceful shutdown
fn setup_signal_handlers(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
            }
        });
    }

    #[cfg(not(unix))]
    {
        // On non-Unix platforms, rely on tokio::signal::ctrl_c() in the main loop
        let _ = shutdown;
    }
}
