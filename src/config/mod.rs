//! Configuration management
//!
//! Players are declared Home Assistant style, as a list of platform entries:
//!
//! ```yaml
//! media_player:
//!   - platform: nadtcp2
//!     name: NAD C338
//!     host: 192.168.1.50
//!     min_volume: -80
//!     max_volume: -10
//!     volume_step: 4
//! ```

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::nad::ClientSettings;

/// Platform name handled by this service
pub const PLATFORM: &str = "nadtcp2";

pub const DEFAULT_NAME: &str = "NAD amplifier";
pub const DEFAULT_PORT: u16 = 30001;
pub const DEFAULT_RECONNECT_INTERVAL: u64 = 10;
pub const DEFAULT_MIN_VOLUME: i32 = -80;
pub const DEFAULT_MAX_VOLUME: i32 = -10;
pub const DEFAULT_VOLUME_STEP: i32 = 4;

/// Device volume limits in dB
const DEVICE_MIN_VOLUME: i32 = -80;
const DEVICE_MAX_VOLUME: i32 = 0;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub media_player: Vec<MediaPlayerConfig>,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPlayerConfig {
    pub platform: String,

    pub host: String,

    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between connection attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    #[serde(default = "default_min_volume")]
    pub min_volume: i32,

    #[serde(default = "default_max_volume")]
    pub max_volume: i32,

    #[serde(default = "default_volume_step")]
    pub volume_step: i32,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL
}

fn default_min_volume() -> i32 {
    DEFAULT_MIN_VOLUME
}

fn default_max_volume() -> i32 {
    DEFAULT_MAX_VOLUME
}

fn default_volume_step() -> i32 {
    DEFAULT_VOLUME_STEP
}

impl MediaPlayerConfig {
    /// A `nadtcp2` entry with every optional field at its default
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            platform: PLATFORM.to_string(),
            host: host.into(),
            name: default_name(),
            port: DEFAULT_PORT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            min_volume: DEFAULT_MIN_VOLUME,
            max_volume: DEFAULT_MAX_VOLUME,
            volume_step: DEFAULT_VOLUME_STEP,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("{}: host must not be empty", self.name);
        }
        if self.min_volume >= self.max_volume {
            bail!(
                "{}: min_volume ({}) must be below max_volume ({})",
                self.name,
                self.min_volume,
                self.max_volume
            );
        }
        // The device accepts volumes below 0 dB only
        if self.min_volume < DEVICE_MIN_VOLUME || self.max_volume >= DEVICE_MAX_VOLUME {
            bail!(
                "{}: volume range {}..{} exceeds device range {}..{} (exclusive)",
                self.name,
                self.min_volume,
                self.max_volume,
                DEVICE_MIN_VOLUME,
                DEVICE_MAX_VOLUME
            );
        }
        if self.volume_step <= 0 {
            bail!("{}: volume_step must be positive", self.name);
        }
        if self.reconnect_interval == 0 {
            bail!("{}: reconnect_interval must be at least 1 second", self.name);
        }
        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            port: self.port,
            reconnect_interval: Duration::from_secs(self.reconnect_interval),
            ..ClientSettings::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

impl Config {
    /// Entries for this platform, validated. Other platforms are skipped.
    pub fn nad_players(&self) -> Result<Vec<MediaPlayerConfig>> {
        let mut players = Vec::new();
        for entry in &self.media_player {
            if entry.platform != PLATFORM {
                tracing::warn!(
                    "Skipping media_player entry '{}' with platform '{}'",
                    entry.name,
                    entry.platform
                );
                continue;
            }
            entry.validate()?;
            players.push(entry.clone());
        }
        Ok(players)
    }
}

/// Get config directory (NADTCP2_CONFIG_DIR or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NADTCP2_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/nadtcp2");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("nadtcp2");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/nadtcp2");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("nadtcp2");
        }
    }

    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let builder = ::config::Config::builder()
        // config.yaml / config.toml / config.json, whichever exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // NADTCP2_MQTT__HOST, NADTCP2_MQTT__PORT, ...
        .add_source(
            ::config::Environment::with_prefix("NADTCP2")
                .separator("__")
                .try_parsing(true),
        );

    let mut config: Config = builder.build()?.try_deserialize()?;

    // Single-amplifier shortcut for container deployments
    if let Ok(host) = std::env::var("NAD_HOST") {
        if !config.media_player.iter().any(|p| p.platform == PLATFORM) {
            let mut player = MediaPlayerConfig::with_host(host);
            if let Ok(name) = std::env::var("NAD_NAME") {
                player.name = name;
            }
            config.media_player.push(player);
        }
    }

    if config.mqtt.is_none() {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            config.mqtt = Some(MqttConfig {
                host,
                port: std::env::var("MQTT_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_else(default_mqtt_port),
                username: std::env::var("MQTT_USERNAME").ok(),
                password: std::env::var("MQTT_PASSWORD").ok(),
                topic_prefix: None,
            });
        }
    }

    Ok(config)
}
