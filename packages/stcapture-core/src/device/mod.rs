//! Device API access and the capture workflow built on it.

pub mod api;
pub mod capture;

pub use api::{DeviceClient, DeviceCommand, DeviceSummary, DeviceTarget};
pub use capture::{extract_media_url, media_path, CaptureConfig, CaptureResult, CaptureWorkflow};
