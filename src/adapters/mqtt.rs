//! MQTT Adapter
//!
//! Bridges the internal event bus to MQTT for Home Assistant integration.
//!
//! Topics (under the configured prefix):
//! - `<prefix>/status` - bridge `online` / `offline` (retained, also the last will)
//! - `<prefix>/<object_id>/state` - entity attributes as JSON (retained)
//! - `<prefix>/<object_id>/availability` - `online` / `offline` (retained)
//! - `<prefix>/<object_id>/command_result` - outcome of control requests
//! - `<prefix>/<object_id>/control` - subscribed; `{"action": ..., "value": ...}`

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, SharedBus};
use crate::config::MqttConfig;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TOPIC_PREFIX: &str = "nadtcp2";
const CLIENT_ID: &str = "nadtcp2";

/// How long `stop` waits for each bridge task to finish
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Internal state
struct MqttState {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: String,
}

impl Default for MqttState {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

impl MqttState {
    /// Connection options, with the bridge status topic as last will
    fn mqtt_options(&self) -> Result<MqttOptions> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("MQTT host not configured"))?;

        let mut options = MqttOptions::new(CLIENT_ID, host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            status_topic(&self.topic_prefix),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        Ok(options)
    }
}

/// An outgoing MQTT message derived from a bus event
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Running bridge tasks
#[derive(Default)]
struct BridgeTasks {
    event_loop: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

/// MQTT Adapter
pub struct MqttAdapter {
    state: Arc<RwLock<MqttState>>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    bus: SharedBus,
    /// Stops the bus forwarder (after it drains pending events)
    shutdown: CancellationToken,
    /// Stops the MQTT event loop
    disconnect: CancellationToken,
    tasks: Mutex<BridgeTasks>,
}

impl MqttAdapter {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(MqttState::default())),
            client: Arc::new(RwLock::new(None)),
            bus,
            shutdown: CancellationToken::new(),
            disconnect: CancellationToken::new(),
            tasks: Mutex::new(BridgeTasks::default()),
        }
    }

    /// Configure the MQTT connection
    pub async fn configure(&self, config: &MqttConfig) {
        let mut state = self.state.write().await;
        state.host = Some(config.host.clone());
        state.port = config.port;
        state.username = config.username.clone();
        state.password = config.password.clone();
        if let Some(ref prefix) = config.topic_prefix {
            state.topic_prefix = prefix.clone();
        }
    }

    /// Start MQTT connection and bridge
    pub async fn start(&self) -> Result<()> {
        let (options, topic_prefix) = {
            let state = self.state.read().await;
            (state.mqtt_options()?, state.topic_prefix.clone())
        };
        let (host, port) = options.broker_address();

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        {
            let mut client_guard = self.client.write().await;
            *client_guard = Some(client.clone());
        }

        tracing::info!("MQTT connecting to {}:{}...", host, port);

        // Event loop: incoming control messages and (re)connection handling
        let bus = self.bus.clone();
        let disconnect = self.disconnect.clone();
        let control_topic = format!("{}/+/control", topic_prefix);
        let bridge_status = status_topic(&topic_prefix);

        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = disconnect.cancelled() => {
                        tracing::info!("MQTT event loop shutting down");
                        break;
                    }
                    result = eventloop.poll() => {
                        match result {
                            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                                let payload = String::from_utf8_lossy(&publish.payload);
                                match parse_control_message(&publish.topic, &payload) {
                                    Some(event) => bus.publish(event),
                                    None => tracing::debug!(
                                        "Ignoring MQTT message on {}",
                                        publish.topic
                                    ),
                                }
                            }
                            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                                tracing::info!("MQTT connected (code: {:?})", ack.code);
                                // Clean sessions drop subscriptions, so renew them on every connect
                                if let Err(e) = client.try_subscribe(&control_topic, QoS::AtMostOnce) {
                                    tracing::warn!("MQTT subscribe to {} failed: {}", control_topic, e);
                                }
                                if let Err(e) = client.try_publish(
                                    &bridge_status,
                                    QoS::AtLeastOnce,
                                    true,
                                    PAYLOAD_ONLINE,
                                ) {
                                    tracing::warn!("MQTT publish to {} failed: {}", bridge_status, e);
                                }
                            }
                            Ok(Event::Incoming(Incoming::Disconnect)) => {
                                tracing::warn!("MQTT disconnected by broker");
                            }
                            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                                tracing::info!("MQTT disconnect sent");
                                break;
                            }
                            Err(e) => {
                                tracing::error!("MQTT error: {}", e);
                                tokio::select! {
                                    _ = disconnect.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        // Bus forwarder: entity state and command results out to MQTT
        let client_clone = self.client.clone();
        let mut rx = self.bus.subscribe();
        let shutdown = self.shutdown.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        drain(&mut rx, &client_clone, &topic_prefix).await;
                        tracing::info!("MQTT bus forwarder shutting down");
                        break;
                    }
                    result = rx.recv() => match result {
                        Ok(event) => forward(&client_clone, &topic_prefix, &event).await,
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!("MQTT forwarder lagged by {} events", n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.event_loop = Some(event_loop);
        tasks.forwarder = Some(forwarder);

        Ok(())
    }

    /// Stop MQTT connection
    ///
    /// Events already on the bus (the adapters' final offline states) are
    /// published first, then the bridge reports itself offline and
    /// disconnects.
    pub async fn stop(&self) {
        let (event_loop, forwarder) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.event_loop.take(), tasks.forwarder.take())
        };

        self.shutdown.cancel();
        if let Some(mut forwarder) = forwarder {
            if tokio::time::timeout(STOP_TIMEOUT, &mut forwarder).await.is_err() {
                tracing::warn!("MQTT forwarder did not drain in time");
                forwarder.abort();
            }
        }

        // Non-blocking: with the broker gone the request queue may be full
        let client = self.client.write().await.take();
        if let Some(client) = client {
            let prefix = self.state.read().await.topic_prefix.clone();
            if let Err(e) =
                client.try_publish(status_topic(&prefix), QoS::AtLeastOnce, true, PAYLOAD_OFFLINE)
            {
                tracing::warn!("MQTT offline status failed: {}", e);
            }
            if let Err(e) = client.try_disconnect() {
                tracing::warn!("MQTT disconnect failed: {}", e);
            }
        }

        // The event loop exits once the disconnect is sent
        if let Some(mut event_loop) = event_loop {
            if tokio::time::timeout(STOP_TIMEOUT, &mut event_loop).await.is_err() {
                tracing::warn!("MQTT event loop did not flush in time");
            }
        }
        self.disconnect.cancel();

        tracing::info!("MQTT adapter stopped");
    }
}

/// Publish whatever is still queued on the bus
async fn drain(
    rx: &mut broadcast::Receiver<BusEvent>,
    client: &RwLock<Option<AsyncClient>>,
    prefix: &str,
) {
    loop {
        match rx.try_recv() {
            Ok(event) => forward(client, prefix, &event).await,
            Err(TryRecvError::Lagged(n)) => {
                tracing::debug!("MQTT forwarder lagged by {} events", n);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

async fn forward(client: &RwLock<Option<AsyncClient>>, prefix: &str, event: &BusEvent) {
    let client = client.read().await.clone();
    let Some(client) = client else {
        return;
    };
    for message in messages_for_event(prefix, event) {
        if let Err(e) = client
            .publish(
                &message.topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload.into_bytes(),
            )
            .await
        {
            tracing::warn!("MQTT publish failed: {}", e);
        }
    }
}

/// Bridge availability topic
pub fn status_topic(prefix: &str) -> String {
    format!("{}/status", prefix)
}

/// Translate a message on `<prefix>/<object_id>/control` into a bus command
pub fn parse_control_message(topic: &str, payload: &str) -> Option<BusEvent> {
    let mut parts = topic.rsplit('/');
    if parts.next()? != "control" {
        return None;
    }
    let object_id = parts.next().filter(|id| !id.is_empty())?.to_string();

    let cmd: Value = serde_json::from_str(payload).ok()?;
    let action = cmd.get("action")?.as_str()?.to_string();
    let value = cmd.get("value").cloned().filter(|v| !v.is_null());

    Some(BusEvent::ControlCommand {
        object_id,
        action,
        value,
    })
}

/// MQTT messages to publish for a bus event
pub fn messages_for_event(prefix: &str, event: &BusEvent) -> Vec<OutgoingMessage> {
    match event {
        BusEvent::EntityUpdated { entity } => {
            let object_id = entity
                .entity_id
                .strip_prefix("media_player.")
                .unwrap_or(&entity.entity_id);
            let state = match serde_json::to_string(entity) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Failed to serialize entity {}: {}", entity.entity_id, e);
                    return Vec::new();
                }
            };
            let availability = if entity.available {
                PAYLOAD_ONLINE
            } else {
                PAYLOAD_OFFLINE
            };
            vec![
                OutgoingMessage {
                    topic: format!("{}/{}/state", prefix, object_id),
                    payload: state,
                    retain: true,
                },
                OutgoingMessage {
                    topic: format!("{}/{}/availability", prefix, object_id),
                    payload: availability.to_string(),
                    retain: true,
                },
            ]
        }
        BusEvent::CommandResult {
            object_id,
            action,
            success,
            error,
        } => vec![OutgoingMessage {
            topic: format!("{}/{}/command_result", prefix, object_id),
            payload: serde_json::json!({
                "action": action,
                "success": success,
                "error": error
            })
            .to_string(),
            retain: false,
        }],
        // Control commands come from MQTT; lifecycle is covered by availability
        BusEvent::ControlCommand { .. }
        | BusEvent::ShuttingDown { .. }
        | BusEvent::AdapterConnected { .. }
        | BusEvent::AdapterDisconnected { .. }
        | BusEvent::AdapterStopped { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntitySnapshot, PlayerState};

    fn snapshot(available: bool) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: "media_player.nad_amplifier".to_string(),
            name: "NAD amplifier".to_string(),
            state: if available {
                PlayerState::On
            } else {
                PlayerState::Unknown
            },
            available,
            volume_level: Some(0.5),
            is_volume_muted: Some(false),
            source: Some("TV".to_string()),
            source_list: vec!["TV".to_string()],
            device_class: "receiver".to_string(),
            icon: "mdi:speaker-multiple".to_string(),
            supported_features: 3980,
        }
    }

    #[test]
    fn test_parse_control_message() {
        let event = parse_control_message(
            "nadtcp2/nad_amplifier/control",
            r#"{"action": "volume_set", "value": 0.3}"#,
        )
        .expect("should parse");

        match event {
            BusEvent::ControlCommand {
                object_id,
                action,
                value,
            } => {
                assert_eq!(object_id, "nad_amplifier");
                assert_eq!(action, "volume_set");
                assert_eq!(value, Some(serde_json::json!(0.3)));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_message_without_value() {
        let event =
            parse_control_message("hifi/den/control", r#"{"action": "turn_on", "value": null}"#)
                .expect("should parse");
        assert!(matches!(
            event,
            BusEvent::ControlCommand { value: None, .. }
        ));
    }

    #[test]
    fn test_parse_control_message_rejects_garbage() {
        assert!(parse_control_message("nadtcp2/amp/control", "turn_on").is_none());
        assert!(parse_control_message("nadtcp2/amp/control", r#"{"value": 1}"#).is_none());
        assert!(parse_control_message("nadtcp2/amp/state", r#"{"action": "turn_on"}"#).is_none());
        assert!(parse_control_message("control", r#"{"action": "turn_on"}"#).is_none());
    }

    #[test]
    fn test_entity_update_messages() {
        let messages = messages_for_event(
            "nadtcp2",
            &BusEvent::EntityUpdated {
                entity: snapshot(true),
            },
        );
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].topic, "nadtcp2/nad_amplifier/state");
        assert!(messages[0].retain);
        let state: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(state["state"], "on");
        assert_eq!(state["volume_level"], 0.5);

        assert_eq!(messages[1].topic, "nadtcp2/nad_amplifier/availability");
        assert_eq!(messages[1].payload, PAYLOAD_ONLINE);
    }

    #[test]
    fn test_unavailable_entity_goes_offline() {
        let messages = messages_for_event(
            "nadtcp2",
            &BusEvent::EntityUpdated {
                entity: snapshot(false),
            },
        );
        assert_eq!(messages[1].payload, PAYLOAD_OFFLINE);
    }

    #[test]
    fn test_command_result_message() {
        let messages = messages_for_event(
            "hifi",
            &BusEvent::CommandResult {
                object_id: "den".to_string(),
                action: "mute".to_string(),
                success: false,
                error: Some("Not connected to amp".to_string()),
            },
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "hifi/den/command_result");
        assert!(!messages[0].retain);
        let payload: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(payload["success"], false);
    }

    #[test]
    fn test_control_commands_are_not_echoed() {
        let messages = messages_for_event(
            "nadtcp2",
            &BusEvent::ControlCommand {
                object_id: "amp".to_string(),
                action: "turn_on".to_string(),
                value: None,
            },
        );
        assert!(messages.is_empty());
    }

    #[test]
    fn test_shutdown_is_not_forwarded() {
        let messages = messages_for_event(
            "nadtcp2",
            &BusEvent::ShuttingDown {
                reason: Some("Coordinator shutdown".to_string()),
            },
        );
        assert!(messages.is_empty());
    }

    #[test]
    fn test_status_topic_cannot_clash_with_entities() {
        // Entity topics are always two levels below the prefix
        assert_eq!(status_topic("nadtcp2"), "nadtcp2/status");
        assert!(parse_control_message(&status_topic("nadtcp2"), r#"{"action": "turn_on"}"#).is_none());
    }

    #[tokio::test]
    async fn test_configure_sets_last_will() {
        let adapter = MqttAdapter::new(crate::bus::create_bus());
        adapter
            .configure(&MqttConfig {
                host: "broker.local".to_string(),
                port: 1884,
                username: Some("ha".to_string()),
                password: Some("secret".to_string()),
                topic_prefix: Some("hifi".to_string()),
            })
            .await;

        let state = adapter.state.read().await;
        assert_eq!(state.topic_prefix, "hifi");
        let options = state.mqtt_options().unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));

        let will = options.last_will().expect("last will should be set");
        assert!(will.retain);
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert_eq!(&will.message[..], PAYLOAD_OFFLINE.as_bytes());
    }

    #[test]
    fn test_options_require_host() {
        assert!(MqttState::default().mqtt_options().is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let adapter = MqttAdapter::new(crate::bus::create_bus());
        tokio::time::timeout(Duration::from_secs(1), adapter.stop())
            .await
            .expect("stop should not block");
    }

    #[tokio::test]
    async fn test_start_requires_host() {
        let adapter = MqttAdapter::new(crate::bus::create_bus());
        assert!(adapter.start().await.is_err());
    }
}
