//! nadtcp2 - NAD amplifier control over TCP
//!
//! Drives NAD C338 amplifiers through their line protocol (port 30001) and
//! exposes each one as a Home Assistant style `media_player` entity.
//!
//! This library provides:
//! - The NAD command codec and a reconnecting TCP client
//! - A media player entity with volume window mapping
//! - MQTT integration for Home Assistant

pub mod adapters;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod nad;
