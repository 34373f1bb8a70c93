//! Bridge configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use umi_types::AudioFormat;
use umi_voice::LiveKitConfig;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Device-facing WebSocket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Room service endpoint and signing key pair.
    #[serde(default)]
    pub livekit: LiveKitConfig,

    /// Audio format and relay settings.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the device WebSocket server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted WebSocket message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Interval between keepalive pings to the device.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// How long past a missed keepalive the device has to show traffic.
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,

    /// Per-connection bound on queued outbound messages.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Audio format and relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Ingest frames between streaming progress log lines.
    #[serde(default = "default_progress_interval_frames")]
    pub progress_interval_frames: u64,

    /// Time allowed for playback tasks to finish when a session ends.
    #[serde(default = "default_playback_drain_timeout_ms")]
    pub playback_drain_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "umi_bridge=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8765
}

fn default_max_message_size() -> usize {
    10_000_000
}

fn default_keepalive_interval_secs() -> u64 {
    20
}

fn default_keepalive_timeout_secs() -> u64 {
    10
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_sample_rate() -> u32 {
    AudioFormat::DEVICE.sample_rate
}

fn default_channels() -> u16 {
    AudioFormat::DEVICE.channels
}

fn default_progress_interval_frames() -> u64 {
    // ~1 s of 30 ms frames
    33
}

fn default_playback_drain_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            progress_interval_frames: default_progress_interval_frames(),
            playback_drain_timeout_ms: default_playback_drain_timeout_ms(),
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

impl ServerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    pub fn playback_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.playback_drain_timeout_ms)
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

    /// The configuration parsed but cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks everything the bridge needs before it accepts a device.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.livekit.url.trim();
        if url.is_empty() || url.contains("your-project") {
            return Err(ConfigError::Invalid(
                "livekit.url must be set to the room service URL".to_string(),
            ));
        }
        if !["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            return Err(ConfigError::Invalid(format!(
                "livekit.url has an unsupported scheme: {}",
                url
            )));
        }
        if self.livekit.api_key.is_empty() || self.livekit.api_key.starts_with("APIxx") {
            return Err(ConfigError::Invalid(
                "livekit.api_key must be set".to_string(),
            ));
        }
        if self.livekit.api_secret.is_empty() || self.livekit.api_secret.starts_with("xxxx") {
            return Err(ConfigError::Invalid(
                "livekit.api_secret must be set".to_string(),
            ));
        }
        if self.livekit.token_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "livekit.token_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.livekit.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "livekit.connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(ConfigError::Invalid(
                "audio.sample_rate and audio.channels must be positive".to_string(),
            ));
        }
        if self.audio.progress_interval_frames == 0 {
            return Err(ConfigError::Invalid(
                "audio.progress_interval_frames must be positive".to_string(),
            ));
        }
        if self.server.keepalive_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.keepalive_interval_secs must be positive".to_string(),
            ));
        }
        if self.server.max_message_size == 0 || self.server.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_size and server.outbound_queue_capacity must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `UMI_HOST` overrides `server.host`
/// - `UMI_PORT` overrides `server.port`
/// - `UMI_LOG_LEVEL` overrides `logging.level`
/// - `UMI_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `LIVEKIT_URL` overrides `livekit.url`
/// - `LIVEKIT_API_KEY` overrides `livekit.api_key`
/// - `LIVEKIT_API_SECRET` overrides `livekit.api_secret`
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

/// Applies overrides from `lookup`, which maps a variable name to its value.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("UMI_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("UMI_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = lookup("UMI_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("UMI_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = lookup("LIVEKIT_URL") {
        config.livekit.url = url;
    }
    if let Some(key) = lookup("LIVEKIT_API_KEY") {
        config.livekit.api_key = key;
    }
    if let Some(secret) = lookup("LIVEKIT_API_SECRET") {
        config.livekit.api_secret = secret;
    }
}
