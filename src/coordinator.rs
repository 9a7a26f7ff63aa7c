//! AdapterCoordinator - lifecycle management for amplifier adapters
//!
//! Every configured amplifier is registered under its entity id and spawned
//! as its own task. Shutdown is cooperative: the coordinator announces it on
//! the bus, waits for each adapter's `AdapterStopped` ACK, then cancels
//! whatever is left.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};

/// Registered adapter and its running task
struct RegisteredAdapter {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct AdapterCoordinator {
    adapters: RwLock<HashMap<String, RegisteredAdapter>>,
    bus: SharedBus,
    /// Parent of all adapter tokens
    shutdown: CancellationToken,
    /// Timeout for shutdown acknowledgments
    shutdown_timeout: Duration,
}

impl AdapterCoordinator {
    pub fn new(bus: SharedBus) -> Self {
        Self::with_shutdown_timeout(bus, Duration::from_secs(5))
    }

    pub fn with_shutdown_timeout(bus: SharedBus, timeout: Duration) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            bus,
            shutdown: CancellationToken::new(),
            shutdown_timeout: timeout,
        }
    }

    /// Register an adapter without starting it
    pub async fn register(&self, prefix: &str) {
        let mut adapters = self.adapters.write().await;
        adapters.insert(
            prefix.to_string(),
            RegisteredAdapter {
                handle: None,
                cancel: self.shutdown.child_token(),
            },
        );
        debug!("Registered adapter: {}", prefix);
    }

    /// Start an adapter with the given spawn function.
    /// The spawn function receives (bus, cancel_token) and returns the adapter task.
    pub async fn start_adapter<F, Fut>(&self, prefix: &str, spawn_fn: F) -> Result<()>
    where
        F: FnOnce(SharedBus, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut adapters = self.adapters.write().await;

        let adapter = adapters
            .get_mut(prefix)
            .ok_or_else(|| anyhow!("Adapter {} not registered", prefix))?;

        if adapter.handle.is_some() {
            debug!("Adapter {} already running", prefix);
            return Ok(());
        }

        let handle = tokio::spawn(spawn_fn(self.bus.clone(), adapter.cancel.clone()));
        adapter.handle = Some(handle);

        info!("Started adapter: {}", prefix);
        Ok(())
    }

    /// Graceful shutdown of all adapters
    /// 1. Publish ShuttingDown event
    /// 2. Wait for AdapterStopped ACKs
    /// 3. Cancel any remaining tasks
    pub async fn shutdown(&self) {
        info!("Coordinator initiating shutdown");

        let running: Vec<String> = {
            let adapters = self.adapters.read().await;
            adapters
                .iter()
                .filter(|(_, a)| a.handle.is_some())
                .map(|(prefix, _)| prefix.clone())
                .collect()
        };

        if running.is_empty() {
            info!("No adapters running, shutdown complete");
            self.shutdown.cancel();
            return;
        }

        info!("Shutting down {} adapter(s): {:?}", running.len(), running);

        // Subscribe before publishing so no ACK is missed
        let rx = self.bus.subscribe();
        self.bus.publish(BusEvent::ShuttingDown {
            reason: Some("Coordinator shutdown".to_string()),
        });

        let acks_received = self.wait_for_acks(rx, &running).await;
        if acks_received < running.len() {
            warn!(
                "Only received {}/{} shutdown ACKs, forcing remaining",
                acks_received,
                running.len()
            );
        }

        self.shutdown.cancel();

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut adapters = self.adapters.write().await;
            adapters
                .iter_mut()
                .filter_map(|(prefix, adapter)| adapter.handle.take().map(|h| (prefix.clone(), h)))
                .collect()
        };

        for (prefix, handle) in handles {
            match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(Ok(())) => debug!("Adapter {} task joined", prefix),
                Ok(Err(e)) => warn!("Adapter {} task panicked: {}", prefix, e),
                Err(_) => warn!("Adapter {} task did not join, abandoning", prefix),
            }
        }

        info!("Coordinator shutdown complete");
    }

    async fn wait_for_acks(
        &self,
        mut rx: tokio::sync::broadcast::Receiver<BusEvent>,
        expected: &[String],
    ) -> usize {
        let mut received: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        while received.len() < expected.len() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(BusEvent::AdapterStopped { adapter })) => {
                    if expected.contains(&adapter) && !received.contains(&adapter) {
                        debug!("Received ACK from adapter: {}", adapter);
                        received.push(adapter);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        received.len()
    }
}
