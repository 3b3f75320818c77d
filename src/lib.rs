//! Wireless M-Bus meter readout
//!
//! Telegrams are parsed by the link layer ([`wmbus`]), handed to every
//! configured meter driver ([`meters`]) and the resulting readings are
//! rendered as text, JSON or environment variables for shell commands
//! and MQTT.

pub mod config;
pub mod dvparser;
pub mod meters;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "shell")]
pub mod shell;
pub mod telegram;
pub mod wmbus;

// Re-export common types for easier access
pub use config::{Config, ConfigError};
pub use meters::{create_meter, ElectricityMeter, Meter, MeterError, MeterOptions, MeterReport, MeterUpdate};
pub use telegram::Telegram;
pub use wmbus::{LinkMode, WMBus};
