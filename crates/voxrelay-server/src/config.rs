//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use voxrelay_vendor::{RecognitionConfig, SynthesisConfig};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Speech-recognition vendor.
    #[serde(default)]
    pub recognition: RecognitionConfig,

    /// Speech-synthesis vendor.
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Reply generation service.
    #[serde(default)]
    pub reply: ReplyConfig,

    /// Per-session behavior.
    #[serde(default)]
    pub session: SessionConfig,

    /// Diagnostic capture of synthesized audio.
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxrelay_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Where and how reply text is obtained.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyConfig {
    /// Streaming endpoint that answers with server-sent events.
    #[serde(default = "default_reply_endpoint")]
    pub endpoint: String,

    /// TCP connect timeout for the reply endpoint.
    #[serde(default = "default_reply_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// `User-Agent` sent to the reply endpoint.
    #[serde(default = "default_reply_user_agent")]
    pub user_agent: String,
}

/// How synthesized audio is delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFraming {
    /// `AUDIO:<seq>:<base64>` text frames.
    #[default]
    Tagged,
    /// Raw binary frames without sequence numbers.
    Binary,
}

/// Per-session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Depth of the per-session outbound queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Default audio delivery mode; clients may override with `?audio=`.
    #[serde(default)]
    pub audio_framing: AudioFraming,

    /// Reply tokens held for a consumer that has not caught up, such as
    /// synthesis still waiting for its vendor connection.
    #[serde(default = "default_reply_token_buffer")]
    pub reply_token_buffer: usize,
}

/// Diagnostic capture settings. Capture is off unless `dir` is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reply_endpoint() -> String {
    "http://127.0.0.1:8123/api/chat/stream".to_string()
}

fn default_reply_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reply_user_agent() -> String {
    concat!("voxrelay/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_outbound_queue() -> usize {
    256
}

fn default_reply_token_buffer() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            endpoint: default_reply_endpoint(),
            connect_timeout_ms: default_reply_connect_timeout_ms(),
            user_agent: default_reply_user_agent(),
        }
    }
}

impl ReplyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            audio_framing: AudioFraming::default(),
            reply_token_buffer: default_reply_token_buffer(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXRELAY_HOST` overrides `server.host`
/// - `VOXRELAY_PORT` overrides `server.port`
/// - `VOXRELAY_LOG_LEVEL` overrides `logging.level`
/// - `VOXRELAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VOXRELAY_ASR_APP_ID`, `VOXRELAY_ASR_ACCESS_KEY_ID`,
///   `VOXRELAY_ASR_ACCESS_KEY_SECRET` override the recognition credentials
/// - `VOXRELAY_TTS_APP_ID`, `VOXRELAY_TTS_API_KEY`, `VOXRELAY_TTS_API_SECRET`
///   override the synthesis credentials
/// - `VOXRELAY_REPLY_ENDPOINT` overrides `reply.endpoint`
/// - `VOXRELAY_CAPTURE_DIR` overrides `capture.dir`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `VOXRELAY_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("VOXRELAY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("VOXRELAY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = lookup("VOXRELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("VOXRELAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    if let Some(v) = lookup("VOXRELAY_ASR_APP_ID") {
        config.recognition.app_id = v;
    }
    if let Some(v) = lookup("VOXRELAY_ASR_ACCESS_KEY_ID") {
        config.recognition.access_key_id = v;
    }
    if let Some(v) = lookup("VOXRELAY_ASR_ACCESS_KEY_SECRET") {
        config.recognition.access_key_secret = v;
    }
    if let Some(v) = lookup("VOXRELAY_TTS_APP_ID") {
        config.synthesis.app_id = v;
    }
    if let Some(v) = lookup("VOXRELAY_TTS_API_KEY") {
        config.synthesis.api_key = v;
    }
    if let Some(v) = lookup("VOXRELAY_TTS_API_SECRET") {
        config.synthesis.api_secret = v;
    }
    if let Some(v) = lookup("VOXRELAY_REPLY_ENDPOINT") {
        config.reply.endpoint = v;
    }
    if let Some(v) = lookup("VOXRELAY_CAPTURE_DIR") {
        config.capture.dir = Some(v).filter(|d| !d.trim().is_empty());
    }
}
