//! Media player entity for a NAD amplifier
//!
//! Mirrors the attributes Home Assistant exposes for a `media_player`:
//! power state, a 0..1 volume level mapped onto the configured dB window,
//! mute, and input source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::MediaPlayerConfig;
use crate::nad::{DeviceState, NadClient, NadResult};

pub const ICON: &str = "mdi:speaker-multiple";
pub const DEVICE_CLASS: &str = "receiver";

/// Home Assistant media player feature flags
pub mod features {
    pub const VOLUME_SET: u32 = 4;
    pub const VOLUME_MUTE: u32 = 8;
    pub const TURN_ON: u32 = 128;
    pub const TURN_OFF: u32 = 256;
    pub const VOLUME_STEP: u32 = 1024;
    pub const SELECT_SOURCE: u32 = 2048;
}

pub const SUPPORT_NAD: u32 = features::VOLUME_SET
    | features::VOLUME_MUTE
    | features::TURN_ON
    | features::TURN_OFF
    | features::VOLUME_STEP
    | features::SELECT_SOURCE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    On,
    Off,
    Unknown,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::On => write!(f, "on"),
            PlayerState::Off => write!(f, "off"),
            PlayerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Configured dB window and step size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl VolumeRange {
    pub fn new(min: i32, max: i32, step: i32) -> Self {
        Self {
            min: min as f64,
            max: max as f64,
            step: step as f64,
        }
    }

    /// dB → 0..1, saturating outside the window. Unknown volume maps to 0.
    pub fn nad_vol_to_internal_vol(&self, nad_vol: Option<f64>) -> f64 {
        match nad_vol {
            None => 0.0,
            Some(v) if v < self.min => 0.0,
            Some(v) if v > self.max => 1.0,
            Some(v) => (v - self.min) / (self.max - self.min),
        }
    }

    /// 0..1 → whole dB within the window
    pub fn internal_vol_to_nad_vol(&self, internal_vol: f64) -> f64 {
        (internal_vol * (self.max - self.min) + self.min).round_ties_even()
    }

    pub fn clamp(&self, nad_vol: f64) -> f64 {
        nad_vol.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone)]
struct EntityState {
    state: PlayerState,
    muted: Option<bool>,
    volume: Option<f64>,
    source: Option<String>,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            state: PlayerState::Unknown,
            muted: None,
            volume: None,
            source: None,
        }
    }
}

/// Serializable view of the entity, published on the bus and over MQTT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub name: String,
    pub state: PlayerState,
    pub available: bool,
    pub volume_level: Option<f64>,
    pub is_volume_muted: Option<bool>,
    pub source: Option<String>,
    pub source_list: Vec<String>,
    pub device_class: String,
    pub icon: String,
    pub supported_features: u32,
}

pub struct NadEntity {
    name: String,
    object_id: String,
    range: VolumeRange,
    client: Arc<NadClient>,
    state: RwLock<EntityState>,
}

impl NadEntity {
    pub fn new(name: impl Into<String>, range: VolumeRange, client: Arc<NadClient>) -> Self {
        let name = name.into();
        Self {
            object_id: slugify(&name),
            name,
            range,
            client,
            state: RwLock::new(EntityState::default()),
        }
    }

    pub fn from_config(config: &MediaPlayerConfig, client: Arc<NadClient>) -> Self {
        Self::new(
            config.name.clone(),
            VolumeRange::new(config.min_volume, config.max_volume, config.volume_step),
            client,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object id used in topics (`nad_amplifier`)
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Full entity id (`media_player.nad_amplifier`)
    pub fn entity_id(&self) -> String {
        format!("media_player.{}", self.object_id)
    }

    pub fn volume_range(&self) -> VolumeRange {
        self.range
    }

    pub fn client(&self) -> &Arc<NadClient> {
        &self.client
    }

    pub fn should_poll(&self) -> bool {
        false
    }

    pub fn supported_features(&self) -> u32 {
        SUPPORT_NAD
    }

    pub fn source_list(&self) -> Vec<String> {
        self.client.available_sources()
    }

    pub async fn state(&self) -> PlayerState {
        self.state.read().await.state
    }

    pub async fn available(&self) -> bool {
        self.state.read().await.state != PlayerState::Unknown
    }

    /// Volume level (0..1)
    pub async fn volume_level(&self) -> Option<f64> {
        self.state.read().await.volume
    }

    pub async fn is_volume_muted(&self) -> Option<bool> {
        self.state.read().await.muted
    }

    pub async fn source(&self) -> Option<String> {
        self.state.read().await.source.clone()
    }

    /// Fold a device state report into the entity attributes.
    ///
    /// Power decides on/off; without a power report the entity is unknown
    /// (and therefore unavailable). Other attributes keep their last value
    /// when absent from the report.
    pub async fn handle_state_changed(&self, device: &DeviceState) {
        let mut state = self.state.write().await;

        state.state = match device.power() {
            Some(true) => PlayerState::On,
            Some(false) => PlayerState::Off,
            None => PlayerState::Unknown,
        };

        if let Some(volume) = device.volume() {
            state.volume = Some(self.range.nad_vol_to_internal_vol(Some(volume)));
        }
        if let Some(muted) = device.muted() {
            state.muted = Some(muted);
        }
        if let Some(source) = device.source() {
            state.source = Some(source.to_string());
        }
    }

    pub async fn snapshot(&self) -> EntitySnapshot {
        let state = self.state.read().await.clone();
        EntitySnapshot {
            entity_id: self.entity_id(),
            name: self.name.clone(),
            state: state.state,
            available: state.state != PlayerState::Unknown,
            volume_level: state.volume,
            is_volume_muted: state.muted,
            source: state.source,
            source_list: self.source_list(),
            device_class: DEVICE_CLASS.to_string(),
            icon: ICON.to_string(),
            supported_features: SUPPORT_NAD,
        }
    }

    pub async fn turn_on(&self) -> NadResult<()> {
        self.client.power_on().await
    }

    pub async fn turn_off(&self) -> NadResult<()> {
        self.client.power_off().await
    }

    /// Set volume level, range 0..1
    pub async fn set_volume_level(&self, level: f64) -> NadResult<()> {
        let level = level.clamp(0.0, 1.0);
        self.client
            .set_volume(self.range.internal_vol_to_nad_vol(level))
            .await
    }

    /// Step volume up by half the configured step
    pub async fn volume_up(&self) -> NadResult<()> {
        match self.volume_level().await {
            Some(level) => {
                let target = self.range.internal_vol_to_nad_vol(level) + self.range.step * 0.5;
                self.client.set_volume(self.range.clamp(target)).await
            }
            None => self.client.volume_up().await,
        }
    }

    /// Step volume down by half the configured step
    pub async fn volume_down(&self) -> NadResult<()> {
        match self.volume_level().await {
            Some(level) => {
                let target = self.range.internal_vol_to_nad_vol(level) - self.range.step * 0.5;
                self.client.set_volume(self.range.clamp(target)).await
            }
            None => self.client.volume_down().await,
        }
    }

    pub async fn mute_volume(&self, mute: bool) -> NadResult<()> {
        if mute {
            self.client.mute().await
        } else {
            self.client.unmute().await
        }
    }

    pub async fn select_source(&self, source: &str) -> NadResult<()> {
        self.client.select_source(source).await
    }
}

/// `NAD amplifier` → `nad_amplifier`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "nad".to_string()
    } else {
        slug.to_string()
    }
}
