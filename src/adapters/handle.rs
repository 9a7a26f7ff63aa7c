//! AdapterHandle - Wraps AdapterLogic with consistent lifecycle management
//!
//! Reconnects with backoff when an adapter loses its device.
//! All retry logic is centralized here - adapters should NOT implement their own retry loops.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::{BusEvent, SharedBus};

/// Retry configuration for adapter run
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retry attempts
    pub initial_delay: Duration,
    /// Maximum delay (backoff caps at this value)
    pub max_delay: Duration,
    /// If the adapter ran at least this long before failing,
    /// the delay resets to initial_delay
    pub stable_run_threshold: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            stable_run_threshold: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            stable_run_threshold: Duration::from_secs(30),
        }
    }

    /// Constant delay between attempts (no backoff)
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }
}

/// AdapterHandle wraps an AdapterLogic implementation and provides:
/// - Shutdown via token or ShuttingDown bus event
/// - Automatic ACK on stop via AdapterStopped event
/// - Automatic retry with exponential backoff
pub struct AdapterHandle<T: AdapterLogic> {
    logic: Arc<T>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl<T: AdapterLogic> AdapterHandle<T> {
    pub fn new(logic: T, bus: SharedBus, shutdown: CancellationToken) -> Self {
        Self {
            logic: Arc::new(logic),
            bus,
            shutdown,
        }
    }

    /// Run the adapter, retrying on error until shutdown.
    ///
    /// When `run()` returns `Err`, waits with exponential backoff and retries.
    /// When `run()` returns `Ok`, exits cleanly.
    pub async fn run_with_retry(self, config: RetryConfig) -> Result<()> {
        let prefix = self.logic.prefix().to_string();
        let mut delay = config.initial_delay;

        loop {
            if self.shutdown.is_cancelled() {
                info!("{}: shutdown before attempt", prefix);
                break;
            }

            let start = Instant::now();
            match self.run_once().await {
                Ok(()) => {
                    info!("{}: clean exit", prefix);
                    break;
                }
                Err(e) => {
                    let run_duration = start.elapsed();

                    if run_duration >= config.stable_run_threshold {
                        info!(
                            "{}: ran for {:?} before failure, resetting backoff",
                            prefix, run_duration
                        );
                        delay = config.initial_delay;
                    }

                    warn!("{}: {}, reconnecting in {:?}", prefix, e, delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            info!("{}: shutdown during backoff", prefix);
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {
                            delay = (delay * 2).min(config.max_delay);
                        }
                    }
                }
            }
        }

        // Automatic ACK
        self.bus.publish(BusEvent::AdapterStopped {
            adapter: prefix.clone(),
        });

        info!("{}: stopped", prefix);
        Ok(())
    }

    /// Run the adapter once.
    ///
    /// Returns `Ok(())` on shutdown and `Err(...)` when it should restart.
    /// A ShuttingDown event cancels the context token; `run` is always
    /// awaited to completion so the adapter can publish its final state.
    async fn run_once(&self) -> Result<()> {
        let prefix = self.logic.prefix();
        let mut rx = self.bus.subscribe();
        let stop = self.shutdown.child_token();

        let ctx = AdapterContext {
            bus: self.bus.clone(),
            shutdown: stop.clone(),
        };

        let run = self.logic.run(ctx);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,

            _ = async {
                while let Ok(event) = rx.recv().await {
                    if matches!(event, BusEvent::ShuttingDown { .. }) {
                        break;
                    }
                }
            } => {
                info!("{}: stopping due to ShuttingDown event", prefix);
                stop.cancel();
            }

            _ = stop.cancelled() => {
                info!("{}: cancelled via token", prefix);
            }
        }

        if let Err(e) = run.await {
            info!("{}: error while stopping: {}", prefix, e);
        }
        Ok(())
    }
}
