//! stcapture CLI - headless SmartThings camera capture agent
//!
//! This binary can:
//! - Exchange a SmartThings authorization code for OAuth tokens
//! - Keep the access token valid (validation, refresh, periodic refresh)
//! - List and describe devices
//! - Capture a still image once, or continuously in live mode

mod daemon;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use stcapture_core::auth::{self, TokenVerifyResult};
use stcapture_core::config;
use stcapture_core::{Agent, AppConfig, DeviceTarget, LogSink, TracingSink};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "stcapture")]
#[command(author = "stcapture contributors")]
#[command(version)]
#[command(about = "Capture still images from a SmartThings camera")]
#[command(long_about = "
stcapture drives a SmartThings camera through the cloud API: it asks the
device for a fresh image, reads the image URL from the device status and
downloads it. OAuth tokens are kept in token.txt and refreshed automatically.

Quick start:
  1. Authorize:         stcapture connect --code <CODE>
  2. Find your camera:  stcapture devices
  3. Take a picture:    stcapture capture --device <DEVICE_ID>
  4. Live mode:         stcapture live --device <DEVICE_ID> --interval 30
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Authorize with SmartThings (authorization-code exchange)
    #[command(alias = "login")]
    Connect {
        /// Authorization code from the redirect URL; without it the authorize URL is shown
        #[arg(short, long)]
        code: Option<String>,
    },

    /// Show token state
    Status,

    /// Refresh the access token now
    Refresh,

    /// List devices visible to the token
    Devices,

    /// Show a device's full description
    Describe {
        /// Device id (defaults to the configured or stored device)
        device: Option<String>,
    },

    /// Capture one image
    Capture {
        /// Device id (defaults to the configured or stored device)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Capture continuously until interrupted
    Live {
        /// Device id (defaults to the configured or stored device)
        #[arg(short, long)]
        device: Option<String>,

        /// Seconds between captures (5-30, defaults to the configured interval)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stcapture={},stcapture_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Connect { ref code } => cmd_connect(&cli, code.as_deref()).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Refresh => cmd_refresh(&cli).await,
        Commands::Devices => cmd_devices(&cli).await,
        Commands::Describe { ref device } => cmd_describe(&cli, device.as_deref()).await,
        Commands::Capture { ref device } => cmd_capture(&cli, device.as_deref()).await,
        Commands::Live { ref device, interval } => {
            let agent = build_agent(&cli)?;
            let target = require_device(&agent, device.as_deref()).await?;
            let period = match interval {
                Some(secs) => std::time::Duration::from_secs(config::clamp_live_interval(secs)),
                None => agent.config.capture.live_interval(),
            };
            daemon::run_live(&agent, target, period).await
        }
        Commands::Config => cmd_config(&cli),
    }
}

/// Progress lines go to stdout in text mode and to the log in JSON mode.
fn sink_for(cli: &Cli) -> Arc<dyn LogSink> {
    match cli.format {
        OutputFormat::Text => Arc::new(|line: &str| println!("  {}", line)),
        OutputFormat::Json => Arc::new(TracingSink),
    }
}

fn load_app_config(cli: &Cli) -> Result<AppConfig> {
    match &cli.config {
        Some(path) => config::load_config_from(path),
        None => Ok(config::load_config()),
    }
}

fn build_agent(cli: &Cli) -> Result<Agent> {
    let app_config = load_app_config(cli)?;
    tracing::debug!(
        "Using API base {} (from {})",
        app_config.api.api_base,
        app_config.source
    );
    Agent::from_config(app_config, sink_for(cli)).context("Failed to set up HTTP transport")
}

async fn require_device(agent: &Agent, explicit: Option<&str>) -> Result<DeviceTarget> {
    agent.resolve_device(explicit).await?.context(
        "No device selected. Pass --device, set [capture] device_id in config.toml, or add device_id to token.txt",
    )
}

async fn cmd_connect(cli: &Cli, code: Option<&str>) -> Result<()> {
    let agent = build_agent(cli)?;

    let Some(code) = code else {
        let record = agent.tokens.current_record().await?;
        if record.credentials.client_id.is_empty() {
            anyhow::bail!(
                "token.txt has no client_id; add client_id and client_secret to {}",
                agent.config.paths.token_file().display()
            );
        }
        let url = auth::authorize_url(&agent.config.api, &record.credentials.client_id)?;
        let opened = auth::open_authorize_page(&url);

        match cli.format {
            OutputFormat::Text => {
                println!("Please visit the following URL to authorize:\n\n{}\n", url);
                if opened {
                    println!("(opened in your browser)");
                }
                println!("Then run: stcapture connect --code <CODE>");
            }
            OutputFormat::Json => {
                println!("{}", serde_json::json!({
                    "status": "awaiting_authorization",
                    "authorize_url": url,
                    "browser_opened": opened,
                }));
            }
        }
        return Ok(());
    };

    agent.tokens.authorize_with_code(code).await?;
    let record = agent.tokens.current_record().await?;

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("Connected. Tokens saved to {}", agent.config.paths.token_file().display());
            if let Some(expires_at) = record.tokens.expires_at() {
                println!("Access token valid until {}", expires_at.to_rfc3339());
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "connected",
                "token_file": agent.config.paths.token_file(),
                "expires_at": record.tokens.expires_at(),
            }));
        }
    }

    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let agent = build_agent(cli)?;
    let record = agent.tokens.current_record().await?;

    let verification = if record.tokens.has_access_token() {
        Some(agent.tokens.verify_token(&record.tokens.access_token).await)
    } else {
        None
    };
    let verdict = match &verification {
        Some(TokenVerifyResult::Valid) => "valid",
        Some(TokenVerifyResult::Invalid) => "rejected",
        Some(TokenVerifyResult::NetworkError(_)) => "unknown",
        None => "missing",
    };

    match cli.format {
        OutputFormat::Text => {
            println!("Token file:     {}", agent.config.paths.token_file().display());
            println!("Client id:      {}", if record.credentials.client_id.is_empty() { "-" } else { record.credentials.client_id.as_str() });
            println!("Access token:   {}", verdict);
            if let Some(TokenVerifyResult::NetworkError(reason)) = &verification {
                println!("                ({})", reason);
            }
            println!("Refresh token:  {}", if record.tokens.has_refresh_token() { "present" } else { "missing" });
            println!(
                "Expires at:     {}",
                record.tokens.expires_at().map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
            );
            println!("Pending code:   {}", if record.auth_code.is_empty() { "no" } else { "yes" });
            println!("Device:         {}", record.device_id().unwrap_or("-"));

            if !record.tokens.has_access_token() && !record.tokens.has_refresh_token() && record.auth_code.is_empty() {
                println!();
                println!("Run 'stcapture connect' to authorize.");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "token_file": agent.config.paths.token_file(),
                "client_id": record.credentials.client_id,
                "access_token": verdict,
                "refresh_token_present": record.tokens.has_refresh_token(),
                "obtained_at": record.tokens.obtained_at,
                "expires_at": record.tokens.expires_at(),
                "auth_code_pending": !record.auth_code.is_empty(),
                "device_id": record.device_id(),
            }));
        }
    }

    Ok(())
}

async fn cmd_refresh(cli: &Cli) -> Result<()> {
    let agent = build_agent(cli)?;
    agent.tokens.force_refresh().await?;
    let record = agent.tokens.current_record().await?;

    match cli.format {
        OutputFormat::Text => {
            println!("Access token refreshed.");
            if let Some(expires_at) = record.tokens.expires_at() {
                println!("Valid until {}", expires_at.to_rfc3339());
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "refreshed",
                "state": agent.tokens.state(),
                "expires_at": record.tokens.expires_at(),
            }));
        }
    }

    Ok(())
}

async fn cmd_devices(cli: &Cli) -> Result<()> {
    let agent = build_agent(cli)?;
    let devices = agent.devices.list_devices().await?;

    match cli.format {
        OutputFormat::Text => {
            println!("Found {} devices:", devices.len());
            println!();
            for device in &devices {
                let label = device
                    .label
                    .as_deref()
                    .or(device.name.as_deref())
                    .unwrap_or("-");
                let camera = if device.capabilities.iter().any(|c| c == "imageCapture") {
                    " [camera]"
                } else {
                    ""
                };
                println!("  {:36}  {}{}", device.device_id, label, camera);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "devices": devices }));
        }
    }

    Ok(())
}

async fn cmd_describe(cli: &Cli, device: Option<&str>) -> Result<()> {
    let agent = build_agent(cli)?;
    let target = require_device(&agent, device).await?;
    let description = agent.devices.describe(&target).await?;

    match cli.format {
        OutputFormat::Text => println!("{}", serde_json::to_string_pretty(&description)?),
        OutputFormat::Json => println!("{}", description),
    }

    Ok(())
}

async fn cmd_capture(cli: &Cli, device: Option<&str>) -> Result<()> {
    let agent = build_agent(cli)?;
    let target = require_device(&agent, device).await?;

    match cli.format {
        OutputFormat::Text => println!("Capturing from {}...", target.device_id),
        OutputFormat::Json => {}
    }

    let result = agent
        .workflow
        .capture(&target, &CancellationToken::new())
        .await?;

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("Saved {}", result.local_path.display());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let app_config = load_app_config(cli)?;
    let config_path = match &cli.config {
        Some(path) => path.display().to_string(),
        None => config::get_config_file_path_string(),
    };

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("API base:         {} (from {})", app_config.api.api_base, app_config.source);
            println!("Token endpoint:   {}", app_config.api.token_url);
            println!("Token file:       {}", app_config.paths.token_file().display());
            println!("Token template:   {}", app_config.paths.resource_dir.join(stcapture_core::paths::TOKEN_FILE_NAME).display());
            println!("Output directory: {}", app_config.capture.output_dir.display());
            println!("Live interval:    {}s", app_config.capture.live_interval().as_secs());
            println!("Refresh interval: {}h", app_config.refresh.interval_hours);
            println!();
            println!("Environment variables:");
            println!("  STCAPTURE_API_URL      - Override API base");
            println!("  STCAPTURE_TOKEN_URL    - Override OAuth token endpoint");
            println!("  STCAPTURE_DATA_DIR     - Override writable data directory");
            println!("  STCAPTURE_RESOURCE_DIR - Override token template directory");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "source": app_config.source.to_string(),
                "config": app_config,
            }));
        }
    }

    Ok(())
}
