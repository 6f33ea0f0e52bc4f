//! Assembles transport, token store, token manager, device client, capture
//! workflow and scheduler from an [`AppConfig`].

use std::sync::Arc;

use crate::auth::{FileTokenStore, TokenManager, TokenStore};
use crate::config::AppConfig;
use crate::device::{CaptureConfig, CaptureWorkflow, DeviceClient, DeviceTarget};
use crate::error::{AuthError, TransportError};
use crate::scheduler::Scheduler;
use crate::sink::LogSink;
use crate::transport::{HttpTransport, Transport};

pub struct Agent {
    pub config: AppConfig,
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<TokenManager>,
    pub devices: DeviceClient,
    pub workflow: Arc<CaptureWorkflow>,
    pub scheduler: Scheduler,
}

impl Agent {
    /// Build with the reqwest transport and the file token store.
    pub fn from_config(config: AppConfig, sink: Arc<dyn LogSink>) -> Result<Self, TransportError> {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(config.transport.to_transport_config())?);
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::from_paths(&config.paths));
        Ok(Self::with_parts(config, transport, store, sink))
    }

    pub fn with_parts(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn TokenStore>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(
            transport.clone(),
            store,
            config.api.clone(),
            sink.clone(),
        ));
        let devices = DeviceClient::new(transport.clone(), tokens.clone());
        let workflow = Arc::new(CaptureWorkflow::new(
            devices.clone(),
            CaptureConfig {
                settle: config.capture.settle(),
                output_dir: config.capture.output_dir.clone(),
            },
            sink.clone(),
        ));
        let scheduler = Scheduler::new(workflow.clone(), tokens.clone(), sink);

        Self {
            config,
            transport,
            tokens,
            devices,
            workflow,
            scheduler,
        }
    }

    /// Device to act on: `explicit`, else the configured device, else the
    /// `device_id` stored next to the tokens.
    pub async fn resolve_device(&self, explicit: Option<&str>) -> Result<Option<DeviceTarget>, AuthError> {
        let chosen = match explicit.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Some(id.to_string()),
            None => match self.config.capture.device_id.clone() {
                Some(id) => Some(id),
                None => self
                    .tokens
                    .current_record()
                    .await?
                    .device_id()
                    .map(str::to_string),
            },
        };
        Ok(chosen.map(|id| self.devices.target(&id)))
    }
}
