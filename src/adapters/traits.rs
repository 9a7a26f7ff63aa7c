use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::SharedBus;

/// Context passed to adapter logic during execution
pub struct AdapterContext {
    /// Event bus for publishing events
    pub bus: SharedBus,
    /// Cancellation token for shutdown coordination
    pub shutdown: CancellationToken,
}

/// Command that can be sent to a media player adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCommand {
    TurnOn,
    TurnOff,
    VolumeUp,
    VolumeDown,
    /// Volume level in 0..1
    VolumeSet(f64),
    Mute(bool),
    SelectSource(String),
}

impl AdapterCommand {
    /// Parse an `action`/`value` pair as sent over MQTT
    pub fn from_action(action: &str, value: Option<&Value>) -> Result<Self> {
        match action {
            "turn_on" => Ok(AdapterCommand::TurnOn),
            "turn_off" => Ok(AdapterCommand::TurnOff),
            "volume_up" => Ok(AdapterCommand::VolumeUp),
            "volume_down" => Ok(AdapterCommand::VolumeDown),
            "volume_set" => value
                .and_then(Value::as_f64)
                .map(AdapterCommand::VolumeSet)
                .ok_or_else(|| anyhow!("volume_set requires a numeric value")),
            "mute" => match value {
                None => Ok(AdapterCommand::Mute(true)),
                Some(v) => v
                    .as_bool()
                    .map(AdapterCommand::Mute)
                    .ok_or_else(|| anyhow!("mute requires a boolean value")),
            },
            "unmute" => Ok(AdapterCommand::Mute(false)),
            "select_source" => value
                .and_then(Value::as_str)
                .map(|s| AdapterCommand::SelectSource(s.to_string()))
                .ok_or_else(|| anyhow!("select_source requires a source name")),
            other => Err(anyhow!("Unknown action: {}", other)),
        }
    }
}

/// Response from command execution
#[derive(Debug, Clone)]
pub struct AdapterCommandResponse {
    pub success: bool,
    pub error: Option<String>,
}

/// Adapter-specific logic trait
///
/// Implementors provide the device protocol handling.
/// Lifecycle (startup, shutdown, retry, ACK) is handled by AdapterHandle.
#[async_trait]
pub trait AdapterLogic: Send + Sync + 'static {
    /// Unique name used in lifecycle events (e.g., "media_player.nad_amplifier")
    fn prefix(&self) -> &str;

    /// Run the adapter's main loop.
    /// Returns Ok when ctx.shutdown is triggered, Err when the device was lost.
    async fn run(&self, ctx: AdapterContext) -> Result<()>;

    /// Handle a command for an entity owned by this adapter
    async fn handle_command(
        &self,
        object_id: &str,
        command: AdapterCommand,
    ) -> Result<AdapterCommandResponse>;
}
