//! Amplifier adapters and integrations (MQTT)

pub mod handle;
pub mod mqtt;
pub mod nad;
pub mod traits;

pub use handle::{AdapterHandle, RetryConfig};
pub use nad::NadAdapter;
pub use traits::{AdapterCommand, AdapterCommandResponse, AdapterContext, AdapterLogic};
