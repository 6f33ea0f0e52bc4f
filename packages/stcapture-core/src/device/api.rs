//! Authenticated calls against the SmartThings device API.
//!
//! Every call obtains its bearer token from the [`TokenManager`]. A 401 marks
//! the token expired and repeats that one call exactly once with a fresh
//! token; a second 401 is returned to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::auth::TokenManager;
use crate::error::{ApiError, ParseError};
use crate::transport::{HttpResponse, Transport};

/// Device addressed by the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub device_id: String,
    pub api_base: String,
}

impl DeviceTarget {
    pub fn new(device_id: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn device_url(&self) -> String {
        format!("{}/devices/{}", self.api_base, self.device_id)
    }

    pub fn commands_url(&self) -> String {
        format!("{}/commands", self.device_url())
    }

    pub fn status_url(&self) -> String {
        format!("{}/status", self.device_url())
    }
}

/// One entry of a `commands` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCommand {
    pub component: String,
    pub capability: String,
    pub command: String,
    pub arguments: Vec<Value>,
}

impl DeviceCommand {
    pub fn new(capability: &str, command: &str) -> Self {
        Self {
            component: "main".to_string(),
            capability: capability.to_string(),
            command: command.to_string(),
            arguments: Vec::new(),
        }
    }

    /// Ask the device to refresh its attributes.
    pub fn refresh() -> Self {
        Self::new("refresh", "refresh")
    }

    /// Ask the camera to take a still image.
    pub fn take_image() -> Self {
        Self::new("imageCapture", "take")
    }

    /// `{"commands": [ ... ]}` request body.
    pub fn payload(commands: &[DeviceCommand]) -> Value {
        serde_json::json!({ "commands": commands })
    }
}

/// Summary entry from `GET /devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    items: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    device_id: String,
    label: Option<String>,
    name: Option<String>,
    #[serde(default)]
    components: Vec<RawComponent>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    #[serde(default)]
    capabilities: Vec<RawCapability>,
}

#[derive(Debug, Deserialize)]
struct RawCapability {
    id: String,
}

impl From<RawDevice> for DeviceSummary {
    fn from(raw: RawDevice) -> Self {
        let mut capabilities: Vec<String> = raw
            .components
            .into_iter()
            .flat_map(|c| c.capabilities.into_iter().map(|cap| cap.id))
            .collect();
        capabilities.sort();
        capabilities.dedup();
        Self {
            device_id: raw.device_id,
            label: raw.label,
            name: raw.name,
            capabilities,
        }
    }
}

enum Call<'a> {
    Get(&'a str),
    PostJson(&'a str, &'a Value),
}

impl Call<'_> {
    fn url(&self) -> &str {
        match self {
            Call::Get(url) | Call::PostJson(url, _) => url,
        }
    }
}

/// Device API client sharing the token manager with the rest of the process.
#[derive(Clone)]
pub struct DeviceClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
    api_base: String,
}

impl DeviceClient {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenManager>) -> Self {
        let api_base = tokens.api().api_base.trim_end_matches('/').to_string();
        Self {
            transport,
            tokens,
            api_base,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Target for `device_id` on the configured API base.
    pub fn target(&self, device_id: &str) -> DeviceTarget {
        DeviceTarget::new(device_id, &self.api_base)
    }

    async fn dispatch(&self, call: &Call<'_>, token: &str) -> Result<HttpResponse, ApiError> {
        let resp = match call {
            Call::Get(url) => self.transport.get(url, token).await?,
            Call::PostJson(url, body) => self.transport.post_json(url, token, body).await?,
        };
        Ok(resp)
    }

    /// Send `call`, retrying it once after a token refresh if it comes back 401.
    async fn send(&self, call: Call<'_>) -> Result<HttpResponse, ApiError> {
        let token = self.tokens.get_valid_token().await?;
        let resp = self.dispatch(&call, &token).await?;
        if resp.status != 401 {
            return Ok(resp);
        }

        tracing::info!("Request to {} rejected with 401, refreshing token and retrying once", call.url());
        self.tokens.invalidate(&token).await;
        let token = self.tokens.get_valid_token().await?;
        self.dispatch(&call, &token).await
    }

    async fn send_ok(&self, call: Call<'_>) -> Result<HttpResponse, ApiError> {
        let resp = self.send(call).await?;
        if !resp.is_success() {
            return Err(ApiError::Status {
                status: resp.status,
                body: resp.body,
            });
        }
        Ok(resp)
    }

    /// POST commands to the device.
    pub async fn send_commands(
        &self,
        device: &DeviceTarget,
        commands: &[DeviceCommand],
    ) -> Result<HttpResponse, ApiError> {
        let url = device.commands_url();
        let body = DeviceCommand::payload(commands);
        self.send_ok(Call::PostJson(&url, &body)).await
    }

    /// Raw `GET /devices/{id}/status` body.
    pub async fn status(&self, device: &DeviceTarget) -> Result<String, ApiError> {
        let url = device.status_url();
        Ok(self.send_ok(Call::Get(&url)).await?.body)
    }

    /// `GET /devices/{id}` as JSON.
    pub async fn describe(&self, device: &DeviceTarget) -> Result<Value, ApiError> {
        let url = device.device_url();
        let resp = self.send_ok(Call::Get(&url)).await?;
        Ok(serde_json::from_str(&resp.body).map_err(ParseError::from)?)
    }

    /// All devices visible to the token.
    pub async fn list_devices(&self) -> Result<Vec<DeviceSummary>, ApiError> {
        let url = format!("{}/devices", self.api_base);
        let resp = self.send_ok(Call::Get(&url)).await?;
        let list: DeviceList = serde_json::from_str(&resp.body).map_err(ParseError::from)?;
        Ok(list.items.into_iter().map(DeviceSummary::from).collect())
    }

    /// Download media to `dest`. Pre-signed URLs get no bearer token and no
    /// retry; other URLs are retried once after a refresh on 401.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), ApiError> {
        if self.transport.is_presigned(url) {
            self.transport.download(url, None, dest).await?;
            return Ok(());
        }

        let token = self.tokens.get_valid_token().await?;
        match self.transport.download(url, Some(&token), dest).await {
            Err(e) if e.status() == Some(401) => {
                tracing::info!("Media download rejected with 401, refreshing token and retrying once");
                self.tokens.invalidate(&token).await;
                let token = self.tokens.get_valid_token().await?;
                self.transport.download(url, Some(&token), dest).await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, MemoryTokenStore, TokenRecord, TokenSet};
    use crate::config::ApiConfig;
    use crate::error::AuthError;
    use crate::sink::NullSink;
    use crate::testing::{ok, ScriptedTransport};

    fn client_with(transport: Arc<ScriptedTransport>) -> DeviceClient {
        let record = TokenRecord {
            credentials: Credentials {
                client_id: "cid".into(),
                client_secret: "sec".into(),
            },
            tokens: TokenSet {
                access_token: "A0".into(),
                refresh_token: "R0".into(),
                obtained_at: Some(chrono::Utc::now()),
                expires_in: Some(86_400),
            },
            ..TokenRecord::default()
        };
        let api = ApiConfig {
            api_base: "https://api.test/v1".into(),
            token_url: "https://auth.test/oauth/token".into(),
            ..ApiConfig::default()
        };
        let manager = Arc::new(TokenManager::new(
            transport.clone(),
            Arc::new(MemoryTokenStore::new(record)),
            api,
            Arc::new(NullSink),
        ));
        DeviceClient::new(transport, manager)
    }

    #[test]
    fn test_command_payload_shape() {
        let body = DeviceCommand::payload(&[DeviceCommand::refresh()]);
        assert_eq!(
            body,
            serde_json::json!({"commands": [{
                "component": "main",
                "capability": "refresh",
                "command": "refresh",
                "arguments": []
            }]})
        );
        assert_eq!(DeviceCommand::take_image().capability, "imageCapture");
        assert_eq!(DeviceCommand::take_image().command, "take");
    }

    #[test]
    fn test_target_urls() {
        let target = DeviceTarget::new("cam-1", "https://api.test/v1/");
        assert_eq!(target.commands_url(), "https://api.test/v1/devices/cam-1/commands");
        assert_eq!(target.status_url(), "https://api.test/v1/devices/cam-1/status");
    }

    #[tokio::test]
    async fn test_retry_once_after_401() {
        let transport = Arc::new(ScriptedTransport::new());
        // validation of the stored token
        transport.on("GET", "/v1/devices", ok(200, "{}"));
        transport.on("GET", "/devices/cam-1/status", ok(401, "expired"));
        transport.on("FORM", "/oauth/token", ok(200, r#"{"access_token":"A1"}"#));
        transport.on("GET", "/devices/cam-1/status", ok(200, r#"{"components":{}}"#));
        let client = client_with(transport.clone());

        let body = client.status(&client.target("cam-1")).await.unwrap();

        assert_eq!(body, r#"{"components":{}}"#);
        assert_eq!(transport.count("FORM", "/oauth/token"), 1);
        let status_calls: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| c.url.ends_with("/status"))
            .collect();
        assert_eq!(status_calls.len(), 2);
        assert_eq!(status_calls[0].bearer.as_deref(), Some("A0"));
        assert_eq!(status_calls[1].bearer.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_second_401_is_returned() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("GET", "/v1/devices", ok(200, "{}"));
        transport.on("POST", "/commands", ok(401, "no"));
        transport.on("FORM", "/oauth/token", ok(200, r#"{"access_token":"A1"}"#));
        transport.on("POST", "/commands", ok(401, "still no"));
        let client = client_with(transport.clone());

        let err = client
            .send_commands(&client.target("cam-1"), &[DeviceCommand::take_image()])
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Status { status: 401, .. }));
        assert_eq!(transport.count("POST", "/commands"), 2);
        assert_eq!(transport.count("FORM", "/oauth/token"), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_as_auth_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("GET", "/v1/devices", ok(200, "{}"));
        transport.on("GET", "/status", ok(401, "no"));
        transport.on("FORM", "/oauth/token", ok(400, r#"{"error":"invalid_grant"}"#));
        let client = client_with(transport.clone());

        let err = client.status(&client.target("cam-1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::Rejected { status: 400, .. })));
    }

    #[tokio::test]
    async fn test_list_devices_collects_capabilities() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("GET", "/v1/devices", ok(200, "{}"));
        transport.on(
            "GET",
            "/v1/devices",
            ok(
                200,
                r#"{"items":[
                    {"deviceId":"cam-1","label":"Porch","name":"c2c-camera",
                     "components":[{"id":"main","capabilities":[{"id":"imageCapture"},{"id":"refresh"}]}]},
                    {"deviceId":"plug-7","components":[]}
                ]}"#,
            ),
        );
        let client = client_with(transport);

        let devices = client.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "cam-1");
        assert_eq!(devices[0].label.as_deref(), Some("Porch"));
        assert_eq!(devices[0].capabilities, vec!["imageCapture", "refresh"]);
        assert!(devices[1].capabilities.is_empty());
    }

    #[tokio::test]
    async fn test_presigned_download_skips_token() {
        let transport = Arc::new(ScriptedTransport::new().with_presigned_marker("X-Amz-Signature"));
        transport.on("DOWNLOAD", "/media/a.jpg", ok(200, ""));
        let client = client_with(transport.clone());
        let dir = tempfile::tempdir().unwrap();

        client
            .download("https://s3.test/media/a.jpg?X-Amz-Signature=x", &dir.path().join("a.jpg"))
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bearer, None);
    }

    #[tokio::test]
    async fn test_download_retries_once_on_401() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("GET", "/v1/devices", ok(200, "{}"));
        transport.on("DOWNLOAD", "/media/a.jpg", ok(401, ""));
        transport.on("FORM", "/oauth/token", ok(200, r#"{"access_token":"A1"}"#));
        transport.on("DOWNLOAD", "/media/a.jpg", ok(200, ""));
        let client = client_with(transport.clone());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.jpg");

        client
            .download("https://api.test/media/a.jpg", &dest)
            .await
            .unwrap();

        assert!(dest.exists());
        assert_eq!(transport.count("DOWNLOAD", "/media/a.jpg"), 2);
    }
}
