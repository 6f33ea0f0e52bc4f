use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::AppPaths;
use crate::transport::TransportConfig;

/// Default SmartThings REST API base
pub const DEFAULT_API_BASE: &str = "https://api.smartthings.com/v1";

/// Default OAuth token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://auth-global.api.smartthings.com/oauth/token";

/// Default OAuth authorization page
pub const DEFAULT_AUTHORIZE_URL: &str = "https://auth-global.api.smartthings.com/oauth/authorize";

const DEFAULT_REDIRECT_URI: &str = "https://localhost/callback";
const DEFAULT_SCOPE: &str = "r:devices:* x:devices:*";
const DEFAULT_USER_AGENT: &str = concat!("stcapture/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SETTLE_SECS: u64 = 5;
const DEFAULT_LIVE_INTERVAL_SECS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_HOURS: u64 = 24;

/// Bounds applied to the live capture period
pub const MIN_LIVE_INTERVAL_SECS: u64 = 5;
pub const MAX_LIVE_INTERVAL_SECS: u64 = 30;

/// Bounds applied to the token refresh period
pub const MIN_REFRESH_INTERVAL_HOURS: u64 = 1;
pub const MAX_REFRESH_INTERVAL_HOURS: u64 = 24 * 30;

/// Query parameter names that mark a URL as pre-signed
pub const DEFAULT_PRESIGNED_MARKERS: &[&str] = &[
    "x-amz-signature",
    "x-amz-credential",
    "signature",
    "sig",
    "token",
    "x-goog-signature",
];

const ENV_API_URL: &str = "STCAPTURE_API_URL";
const ENV_TOKEN_URL: &str = "STCAPTURE_TOKEN_URL";
const ENV_DATA_DIR: &str = "STCAPTURE_DATA_DIR";
const ENV_RESOURCE_DIR: &str = "STCAPTURE_RESOURCE_DIR";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    api: Option<ApiSection>,
    transport: Option<TransportSection>,
    capture: Option<CaptureSection>,
    refresh: Option<RefreshSection>,
    paths: Option<PathsSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiSection {
    api_base: Option<String>,
    token_url: Option<String>,
    authorize_url: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<String>,
    client_auth: Option<ClientAuth>,
}

#[derive(Debug, Deserialize, Default)]
struct TransportSection {
    timeout_secs: Option<u64>,
    download_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    insecure_skip_tls_verify: Option<bool>,
    presigned_markers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureSection {
    device_id: Option<String>,
    settle_secs: Option<u64>,
    output_dir: Option<PathBuf>,
    live_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RefreshSection {
    interval_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PathsSection {
    data_dir: Option<PathBuf>,
    resource_dir: Option<PathBuf>,
}

/// How client credentials are presented to the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    /// `client_id` and `client_secret` as form fields
    #[default]
    Body,
    /// HTTP Basic authentication header
    Basic,
}

/// OAuth and REST endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ApiConfig {
    pub api_base: String,
    pub token_url: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub scope: String,
    pub client_auth: ClientAuth,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            client_auth: ClientAuth::Body,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportSettings {
    pub timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub user_agent: String,
    pub insecure_skip_tls_verify: bool,
    pub presigned_markers: Vec<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            insecure_skip_tls_verify: false,
            presigned_markers: DEFAULT_PRESIGNED_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl TransportSettings {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            user_agent: self.user_agent.clone(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            presigned_markers: self.presigned_markers.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSettings {
    /// Device used when none is given on the command line or in the token store
    pub device_id: Option<String>,
    pub settle_secs: u64,
    pub output_dir: PathBuf,
    pub live_interval_secs: u64,
}

impl CaptureSettings {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Live capture period, clamped to the supported range.
    pub fn live_interval(&self) -> Duration {
        Duration::from_secs(clamp_live_interval(self.live_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSettings {
    pub interval_hours: u64,
}

impl RefreshSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(clamp_refresh_interval(self.interval_hours).saturating_mul(3600))
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub transport: TransportSettings,
    pub capture: CaptureSettings,
    pub refresh: RefreshSettings,
    pub paths: AppPaths,
    /// Source of the API endpoint (for logging)
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConfigSource {
    /// Using default hardcoded values
    #[default]
    Default,
    /// Loaded from environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Values read from the process environment
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub api_url: Option<String>,
    pub token_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub resource_dir: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup; blank values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            api_url: get(ENV_API_URL).map(|u| normalize_url(&u)),
            token_url: get(ENV_TOKEN_URL).map(|u| normalize_url(&u)),
            data_dir: get(ENV_DATA_DIR).map(PathBuf::from),
            resource_dir: get(ENV_RESOURCE_DIR).map(PathBuf::from),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn non_empty_url(value: Option<String>) -> Option<String> {
    value.map(|u| normalize_url(&u)).filter(|u| !u.is_empty())
}

pub fn clamp_live_interval(secs: u64) -> u64 {
    let clamped = secs.clamp(MIN_LIVE_INTERVAL_SECS, MAX_LIVE_INTERVAL_SECS);
    if clamped != secs {
        tracing::warn!(
            "Live interval {}s outside {}..={}s, using {}s",
            secs,
            MIN_LIVE_INTERVAL_SECS,
            MAX_LIVE_INTERVAL_SECS,
            clamped
        );
    }
    clamped
}

pub fn clamp_refresh_interval(hours: u64) -> u64 {
    let clamped = hours.clamp(MIN_REFRESH_INTERVAL_HOURS, MAX_REFRESH_INTERVAL_HOURS);
    if clamped != hours {
        tracing::warn!(
            "Refresh interval {}h outside {}..={}h, using {}h",
            hours,
            MIN_REFRESH_INTERVAL_HOURS,
            MAX_REFRESH_INTERVAL_HOURS,
            clamped
        );
    }
    clamped
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("stcapture").join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .map(|p| p.join("stcapture"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_resource_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("stcapture"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_output_dir(data_dir: &Path) -> PathBuf {
    dirs::picture_dir()
        .map(|p| p.join("stcapture"))
        .unwrap_or_else(|| data_dir.join("captures"))
}

/// Load configuration from the config file
fn load_config_file(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load configuration with priority:
/// 1. Environment variables (STCAPTURE_API_URL, STCAPTURE_TOKEN_URL, STCAPTURE_DATA_DIR, STCAPTURE_RESOURCE_DIR)
/// 2. Config file (~/.config/stcapture/config.toml)
/// 3. Default values
pub fn load_config() -> AppConfig {
    let file = get_config_file_path().and_then(|path| load_config_file(&path));
    resolve(file.unwrap_or_default(), &EnvOverrides::from_env())
}

/// Load configuration from an explicit file path, still honouring the environment.
pub fn load_config_from(path: &Path) -> anyhow::Result<AppConfig> {
    use anyhow::Context;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let file: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(resolve(file, &EnvOverrides::from_env()))
}

/// Parse TOML text into a configuration, applying `env` on top.
pub fn parse_config(content: &str, env: &EnvOverrides) -> anyhow::Result<AppConfig> {
    let file: ConfigFile = toml::from_str(content)?;
    Ok(resolve(file, env))
}

fn resolve(file: ConfigFile, env: &EnvOverrides) -> AppConfig {
    let defaults = ApiConfig::default();
    let api_section = file.api.unwrap_or_default();
    let file_api_base = non_empty_url(api_section.api_base);

    let (api_base, source) = if let Some(url) = env.api_url.clone() {
        tracing::info!("Using API base from environment variable: {}", url);
        (url, ConfigSource::Environment)
    } else if let Some(url) = file_api_base {
        tracing::info!("Using API base from config file: {}", url);
        (url, ConfigSource::ConfigFile)
    } else {
        tracing::debug!("Using default API base: {}", DEFAULT_API_BASE);
        (defaults.api_base, ConfigSource::Default)
    };

    let api = ApiConfig {
        api_base,
        token_url: env
            .token_url
            .clone()
            .or_else(|| non_empty_url(api_section.token_url))
            .unwrap_or(defaults.token_url),
        authorize_url: non_empty_url(api_section.authorize_url).unwrap_or(defaults.authorize_url),
        redirect_uri: api_section
            .redirect_uri
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(defaults.redirect_uri),
        scope: api_section.scope.unwrap_or(defaults.scope),
        client_auth: api_section.client_auth.unwrap_or_default(),
    };

    let transport_defaults = TransportSettings::default();
    let transport_section = file.transport.unwrap_or_default();
    let transport = TransportSettings {
        timeout_secs: transport_section
            .timeout_secs
            .unwrap_or(transport_defaults.timeout_secs),
        download_timeout_secs: transport_section
            .download_timeout_secs
            .unwrap_or(transport_defaults.download_timeout_secs),
        user_agent: transport_section
            .user_agent
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or(transport_defaults.user_agent),
        insecure_skip_tls_verify: transport_section.insecure_skip_tls_verify.unwrap_or(false),
        presigned_markers: transport_section
            .presigned_markers
            .map(|markers| markers.into_iter().map(|m| m.to_ascii_lowercase()).collect())
            .unwrap_or(transport_defaults.presigned_markers),
    };

    let paths_section = file.paths.unwrap_or_default();
    let data_dir = env
        .data_dir
        .clone()
        .or(paths_section.data_dir)
        .unwrap_or_else(default_data_dir);
    let resource_dir = env
        .resource_dir
        .clone()
        .or(paths_section.resource_dir)
        .unwrap_or_else(default_resource_dir);

    let capture_section = file.capture.unwrap_or_default();
    let capture = CaptureSettings {
        device_id: capture_section.device_id.filter(|id| !id.trim().is_empty()),
        settle_secs: capture_section.settle_secs.unwrap_or(DEFAULT_SETTLE_SECS),
        output_dir: capture_section
            .output_dir
            .unwrap_or_else(|| default_output_dir(&data_dir)),
        live_interval_secs: clamp_live_interval(
            capture_section
                .live_interval_secs
                .unwrap_or(DEFAULT_LIVE_INTERVAL_SECS),
        ),
    };

    let refresh = RefreshSettings {
        interval_hours: clamp_refresh_interval(
            file.refresh
                .and_then(|r| r.interval_hours)
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_HOURS),
        ),
    };

    AppConfig {
        api,
        transport,
        capture,
        refresh,
        paths: AppPaths::new(data_dir, resource_dir),
        source,
    }
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/stcapture/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# stcapture configuration
# Place this file at: ~/.config/stcapture/config.toml

[api]
# api_base = "https://api.smartthings.com/v1"
# token_url = "https://auth-global.api.smartthings.com/oauth/token"
# authorize_url = "https://auth-global.api.smartthings.com/oauth/authorize"
# redirect_uri = "https://localhost/callback"
# scope = "r:devices:* x:devices:*"
# How client credentials reach the token endpoint: "body" or "basic"
# client_auth = "body"

[transport]
# timeout_secs = 30
# download_timeout_secs = 60
# user_agent = "stcapture/0.3.0"
# Accept any TLS certificate. Only for debugging against a proxy.
# insecure_skip_tls_verify = false
# presigned_markers = ["x-amz-signature", "x-amz-credential", "signature", "sig", "token", "x-goog-signature"]

[capture]
# device_id = "00000000-0000-0000-0000-000000000000"
# settle_secs = 5
# output_dir = "/home/me/Pictures/stcapture"
# Live capture period, 5 to 30 seconds
# live_interval_secs = 30

[refresh]
# Token refresh period, 1 to 720 hours
# interval_hours = 24

[paths]
# Writable directory holding token.txt and its backups
# data_dir = "/home/me/.local/share/stcapture"
# Directory holding the token.txt template copied on first run
# resource_dir = "/home/me/.config/stcapture"
"#
    .to_string()
}
