//! stcapture Core Library
//!
//! This crate provides the core functionality for capturing still images from
//! a SmartThings camera:
//! - OAuth token lifecycle (authorization-code exchange, validation, refresh)
//! - Token persistence in a `key=value` store file
//! - Device API access with a single retry on 401
//! - The capture workflow (refresh, take, status, extract URL, download)
//! - Timers for live capture and periodic token refresh
//!
//! # Features
//!
//! - `browser` (default): Open the OAuth authorization page automatically
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stcapture_core::{config, Agent, TracingSink};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let agent = Agent::from_config(config::load_config(), Arc::new(TracingSink))?;
//!
//!     // One capture now
//!     let device = agent.devices.target("00000000-0000-0000-0000-000000000000");
//!     let result = agent.workflow.capture(&device, &CancellationToken::new()).await?;
//!     println!("Saved {}", result.local_path.display());
//!
//!     // Keep the token fresh in the background
//!     let refresh = agent.scheduler.start_token_refresh(agent.config.refresh.interval());
//!     refresh.cancel();
//!
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod paths;
pub mod scheduler;
pub mod sink;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use agent::Agent;
pub use auth::{TokenManager, TokenState, TokenStore};
pub use config::{AppConfig, ConfigSource};
pub use device::{CaptureResult, CaptureWorkflow, DeviceClient, DeviceTarget};
pub use error::{ApiError, AuthError, CaptureError, CaptureStage, ParseError, StoreError, TransportError};
pub use scheduler::{Scheduler, TimerHandle, TimerStats};
pub use sink::{LogSink, NullSink, TracingSink};
pub use transport::{HttpResponse, HttpTransport, Transport};
