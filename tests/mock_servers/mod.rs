//! Mock servers for adapter integration testing
//!
//! Simulates a NAD amplifier so the client, entity and adapter can be
//! exercised end to end without real hardware.

pub mod nad;

pub use nad::MockNadAmp;
