//! Capture workflow: refresh -> take -> status -> extract URL -> download.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::api::{DeviceClient, DeviceCommand, DeviceTarget};
use crate::error::{CaptureError, CaptureStage};
use crate::sink::LogSink;

const URL_SCHEME: &str = "https://";
const IMAGE_VALUE_POINTER: &str = "/components/main/imageCapture/image/value";
const DEFAULT_EXTENSION: &str = "jpg";

/// Workflow settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Pause after each device command
    pub settle: Duration,
    pub output_dir: PathBuf,
}

/// Outcome of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureResult {
    pub image_url: String,
    pub local_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

pub struct CaptureWorkflow {
    client: DeviceClient,
    config: CaptureConfig,
    sink: Arc<dyn LogSink>,
}

impl CaptureWorkflow {
    pub fn new(client: DeviceClient, config: CaptureConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            client,
            config,
            sink,
        }
    }

    /// Run one capture against `device`.
    ///
    /// `cancel` is checked between steps; an in-flight request is never
    /// interrupted, but the settle pauses are.
    pub async fn capture(
        &self,
        device: &DeviceTarget,
        cancel: &CancellationToken,
    ) -> Result<CaptureResult, CaptureError> {
        checkpoint(cancel)?;
        self.client
            .tokens()
            .get_valid_token()
            .await
            .map_err(|e| CaptureError::from_api(CaptureStage::Auth, e.into()))?;

        checkpoint(cancel)?;
        self.sink.append_log("Sending refresh command...");
        match self
            .client
            .send_commands(device, &[DeviceCommand::refresh()])
            .await
        {
            Ok(_) => tracing::debug!("Refresh command accepted by {}", device.device_id),
            Err(e) => {
                tracing::warn!("Refresh command failed, continuing: {}", e);
                self.sink
                    .append_log(&format!("Refresh command failed (continuing): {}", e));
            }
        }
        self.settle(cancel).await?;

        self.sink.append_log("Sending take command...");
        self.client
            .send_commands(device, &[DeviceCommand::take_image()])
            .await
            .map_err(|e| CaptureError::from_api(CaptureStage::Command, e))?;
        self.settle(cancel).await?;

        self.sink.append_log("Fetching device status...");
        let status = self
            .client
            .status(device)
            .await
            .map_err(|e| CaptureError::from_api(CaptureStage::StatusFetch, e))?;

        let Some(image_url) = extract_media_url(&status) else {
            self.sink.append_log("No image URL found in device status");
            return Err(CaptureError::new(
                CaptureStage::NoUrlFound,
                "device status contains no https:// URL",
            ));
        };
        tracing::debug!("Media URL found for {}", device.device_id);

        checkpoint(cancel)?;
        let local_path = media_path(&self.config.output_dir, &image_url, Local::now());
        self.sink.append_log("Downloading image...");
        self.client
            .download(&image_url, &local_path)
            .await
            .map_err(|e| CaptureError::from_api(CaptureStage::Download, e))?;

        self.sink
            .append_log(&format!("Image saved: {}", local_path.display()));
        Ok(CaptureResult {
            image_url,
            local_path,
            downloaded_at: Utc::now(),
        })
    }

    async fn settle(&self, cancel: &CancellationToken) -> Result<(), CaptureError> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.settle) => checkpoint(cancel),
            _ = cancel.cancelled() => Err(cancelled()),
        }
    }
}

fn cancelled() -> CaptureError {
    CaptureError::new(CaptureStage::Cancelled, "capture disabled")
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), CaptureError> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    Ok(())
}

/// Find the image URL in a device status body.
///
/// The `imageCapture.image` attribute of the main component is preferred.
/// Otherwise the raw body is scanned for the first `https://` and the URL
/// runs up to the next `"` (or the end of the body).
pub fn extract_media_url(status_body: &str) -> Option<String> {
    if let Ok(status) = serde_json::from_str::<Value>(status_body) {
        let typed = status
            .pointer(IMAGE_VALUE_POINTER)
            .and_then(Value::as_str)
            .filter(|url| url.starts_with(URL_SCHEME) && url.len() > URL_SCHEME.len());
        if let Some(url) = typed {
            return Some(url.to_string());
        }
    }
    scan_for_url(status_body)
}

fn scan_for_url(body: &str) -> Option<String> {
    let start = body.find(URL_SCHEME)?;
    let rest = &body[start..];
    let end = rest.find('"').unwrap_or(rest.len());
    let url = rest[..end].trim_end();
    (url.len() > URL_SCHEME.len()).then(|| url.to_string())
}

/// `capture_YYYYMMDD_HHMMSS.<ext>` in `dir`, with `_1`, `_2`, ... appended
/// when the name is taken. The extension comes from the URL path when it
/// looks like one, otherwise `jpg`.
pub fn media_path(dir: &Path, image_url: &str, at: DateTime<Local>) -> PathBuf {
    let stem = format!("capture_{}", at.format("%Y%m%d_%H%M%S"));
    let ext = media_extension(image_url);

    let mut candidate = dir.join(format!("{}.{}", stem, ext));
    let mut suffix = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.{}", stem, suffix, ext));
        suffix += 1;
    }
    candidate
}

fn media_extension(image_url: &str) -> String {
    let Ok(url) = reqwest::Url::parse(image_url) else {
        return DEFAULT_EXTENSION.to_string();
    };
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    match last_segment.rsplit_once('.') {
        Some((name, ext))
            if !name.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}
