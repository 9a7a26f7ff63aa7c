//! nadtcp2 - NAD amplifier control over TCP
//!
//! Runs one adapter per configured amplifier and bridges them to MQTT.

use nadtcp2::adapters::{mqtt::MqttAdapter, NadAdapter};
use nadtcp2::{bus, config, coordinator::AdapterCoordinator};

use anyhow::Result;
use std::collections::HashSet;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nadtcp2=debug,rumqttc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting nadtcp2 v{} ({})",
        env!("NADTCP2_VERSION"),
        env!("NADTCP2_GIT_SHA")
    );

    let config = config::load_config()?;
    let players = config.nad_players()?;
    tracing::info!("Configuration loaded, {} player(s)", players.len());

    let bus = bus::create_bus();
    let coordinator = AdapterCoordinator::new(bus.clone());

    let mut seen = HashSet::new();
    for player in &players {
        let adapter = NadAdapter::from_config(player);
        let entity_id = adapter.entity().entity_id();
        if !seen.insert(entity_id.clone()) {
            tracing::warn!(
                "Skipping {} at {}: entity {} already configured",
                player.name,
                player.host,
                entity_id
            );
            continue;
        }

        coordinator.register(&entity_id).await;
        let id = entity_id.clone();
        coordinator
            .start_adapter(&entity_id, move |bus, cancel| async move {
                let (handle, retry) = adapter.into_handle(bus, cancel);
                if let Err(e) = handle.run_with_retry(retry).await {
                    tracing::error!("Adapter {} exited: {}", id, e);
                }
            })
            .await?;
        tracing::info!("{} -> {}:{}", entity_id, player.host, player.port);
    }

    if players.is_empty() {
        tracing::warn!(
            "No {} media players configured; add a media_player entry to config.yaml",
            config::PLATFORM
        );
    }

    let mqtt = MqttAdapter::new(bus.clone());
    if let Some(ref mqtt_config) = config.mqtt {
        mqtt.configure(mqtt_config).await;
        if let Err(e) = mqtt.start().await {
            tracing::warn!("Failed to start MQTT adapter: {}", e);
        } else {
            tracing::info!("MQTT adapter started for {}", mqtt_config.host);
        }
    }

    shutdown_signal().await;

    tracing::info!("Shutting down adapters...");
    coordinator.shutdown().await;
    mqtt.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
