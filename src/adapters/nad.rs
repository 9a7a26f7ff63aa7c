//! NAD amplifier adapter
//!
//! Connects one `NadClient`, keeps its `NadEntity` in sync with the
//! amplifier's notifications, and executes control commands addressed to
//! the entity. Reconnection is left to `AdapterHandle`: `run` returns an
//! error whenever the connection drops.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::adapters::handle::{AdapterHandle, RetryConfig};
use crate::adapters::traits::{
    AdapterCommand, AdapterCommandResponse, AdapterContext, AdapterLogic,
};
use crate::bus::{BusEvent, SharedBus};
use crate::config::MediaPlayerConfig;
use crate::entity::NadEntity;
use crate::nad::{DeviceState, NadClient};

pub struct NadAdapter {
    entity: NadEntity,
    entity_id: String,
    retry: RetryConfig,
}

impl NadAdapter {
    pub fn new(entity: NadEntity) -> Self {
        let retry = RetryConfig::fixed(entity.client().settings().reconnect_interval);
        Self {
            entity_id: entity.entity_id(),
            entity,
            retry,
        }
    }

    pub fn from_config(config: &MediaPlayerConfig) -> Self {
        let client = Arc::new(NadClient::new(
            config.host.clone(),
            config.client_settings(),
        ));
        Self::new(NadEntity::from_config(config, client))
    }

    pub fn entity(&self) -> &NadEntity {
        &self.entity
    }

    /// Reconnect policy: a fixed `reconnect_interval` between attempts
    pub fn retry_config(&self) -> RetryConfig {
        self.retry.clone()
    }

    /// Wrap in an `AdapterHandle` ready to be spawned
    pub fn into_handle(
        self,
        bus: SharedBus,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> (AdapterHandle<Self>, RetryConfig) {
        let retry = self.retry_config();
        (AdapterHandle::new(self, bus, shutdown), retry)
    }

    async fn apply_state(&self, state: &DeviceState, bus: &SharedBus) {
        self.entity.handle_state_changed(state).await;
        bus.publish(BusEvent::EntityUpdated {
            entity: self.entity.snapshot().await,
        });
    }

    async fn execute(&self, command: AdapterCommand) -> crate::nad::NadResult<()> {
        match command {
            AdapterCommand::TurnOn => self.entity.turn_on().await,
            AdapterCommand::TurnOff => self.entity.turn_off().await,
            AdapterCommand::VolumeUp => self.entity.volume_up().await,
            AdapterCommand::VolumeDown => self.entity.volume_down().await,
            AdapterCommand::VolumeSet(level) => self.entity.set_volume_level(level).await,
            AdapterCommand::Mute(mute) => self.entity.mute_volume(mute).await,
            AdapterCommand::SelectSource(source) => self.entity.select_source(&source).await,
        }
    }

    /// Route a bus control request to this entity, publishing the outcome
    async fn on_control(
        &self,
        object_id: &str,
        action: &str,
        value: Option<&serde_json::Value>,
        bus: &SharedBus,
    ) {
        if object_id != self.entity.object_id() {
            return;
        }

        let response = match AdapterCommand::from_action(action, value) {
            Ok(command) => match self.handle_command(object_id, command).await {
                Ok(response) => response,
                Err(e) => AdapterCommandResponse {
                    success: false,
                    error: Some(e.to_string()),
                },
            },
            Err(e) => AdapterCommandResponse {
                success: false,
                error: Some(e.to_string()),
            },
        };

        if let Some(ref error) = response.error {
            warn!("{}: {} failed: {}", self.entity_id, action, error);
        }

        bus.publish(BusEvent::CommandResult {
            object_id: object_id.to_string(),
            action: action.to_string(),
            success: response.success,
            error: response.error,
        });
    }
}

#[async_trait]
impl AdapterLogic for NadAdapter {
    fn prefix(&self) -> &str {
        &self.entity_id
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        let client = self.entity.client();

        // Publish the unavailable state before the first connection
        if !client.is_connected().await {
            self.apply_state(&client.status().await, &ctx.bus).await;
        }

        let reader = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            reader = client.connect() => reader?,
        };
        ctx.bus.publish(BusEvent::AdapterConnected {
            adapter: self.entity_id.clone(),
            details: client.addr(),
        });

        let mut states = client.subscribe();
        let mut events = ctx.bus.subscribe();
        let read = client.read_loop(reader);
        tokio::pin!(read);

        let result: Result<()> = loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    info!("{}: shutdown requested", self.entity_id);
                    client.disconnect().await;
                    break Ok(());
                }
                result = &mut read => {
                    break result.map_err(anyhow::Error::from);
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let state = states.borrow_and_update().clone();
                    self.apply_state(&state, &ctx.bus).await;
                }
                event = events.recv() => match event {
                    Ok(BusEvent::ControlCommand { object_id, action, value }) => {
                        self.on_control(&object_id, &action, value.as_ref(), &ctx.bus).await;
                    }
                    Ok(BusEvent::ShuttingDown { .. }) => {
                        client.disconnect().await;
                        break Ok(());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        debug!("{}: bus lagged by {} events", self.entity_id, n);
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },
            }
        };

        let cleared = client.connection_lost().await;
        self.apply_state(&cleared, &ctx.bus).await;
        ctx.bus.publish(BusEvent::AdapterDisconnected {
            adapter: self.entity_id.clone(),
            reason: result.as_ref().err().map(|e| e.to_string()),
        });

        result
    }

    async fn handle_command(
        &self,
        object_id: &str,
        command: AdapterCommand,
    ) -> Result<AdapterCommandResponse> {
        debug!("{}: executing {:?}", object_id, command);

        match self.execute(command).await {
            Ok(()) => Ok(AdapterCommandResponse {
                success: true,
                error: None,
            }),
            Err(e) => Ok(AdapterCommandResponse {
                success: false,
                error: Some(e.to_string()),
            }),
        }
    }
}
