use std::sync::Arc;
use log::warn;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::MeterConfig;
use crate::dvparser::DvParser;
use crate::telegram::Telegram;
use crate::wmbus::{LinkMode, TelegramListener, WMBus};

pub mod common;
pub mod omnipower;
pub mod utils;

pub use common::{MeterCommon, MeterIdentity};
pub use omnipower::{create_omnipower, MeterOmnipower, OmnipowerState};

/// Errors a meter driver can raise for a single telegram or at creation time.
/// None of them leaves the driver unusable.
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("({driver}) expected telegram with version 0x{expected:02x}, but got version 0x{got:02x}")]
    VersionMismatch { driver: &'static str, expected: u8, got: u8 },
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid meter id: {0}")]
    InvalidId(String),
    #[error("Unknown driver: {0}")]
    UnknownDriver(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramStatus {
    /// Address did not match, silently dropped
    NotForMe,
    /// State was updated and listeners notified
    Handled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterType {
    Omnipower,
}

impl MeterType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "omnipower" => Some(MeterType::Omnipower),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            MeterType::Omnipower => "omnipower".to_string(),
        }
    }

    pub fn media(&self) -> &'static str {
        match self {
            MeterType::Omnipower => "electricity",
        }
    }
}

/// Diagnostics switches handed to every driver instead of global flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterOptions {
    /// Log accepted telegrams at info instead of debug
    pub verbose: bool,
    /// Log the annotated bytes of every handled telegram
    pub debug: bool,
    pub log_telegrams: bool,
}

/// Sent to subscribers after a telegram advanced the state of a meter.
#[derive(Debug, Clone)]
pub struct MeterUpdate {
    pub meter: String,
    pub telegram: Telegram,
}

/// The four renderings of one state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReport {
    pub human_readable: String,
    pub fields: String,
    pub json: String,
    pub envs: Vec<String>,
}

pub trait Meter: TelegramListener {
    fn name(&self) -> &str;
    fn id(&self) -> &str;
    fn meter_type(&self) -> MeterType;
    fn link_mode(&self) -> LinkMode;
    fn num_updates(&self) -> u64;
    /// Fire and forget notifications, one per handled telegram
    fn subscribe(&self) -> broadcast::Receiver<MeterUpdate>;
    /// Run the whole acceptance, decryption, extraction and update sequence.
    fn process_telegram(&self, t: &mut Telegram) -> Result<TelegramStatus, MeterError>;
    fn print_meter(&self, t: &Telegram, separator: char) -> MeterReport;
}

pub trait ElectricityMeter: Meter {
    fn total_energy_consumption(&self) -> f64;
    fn current_power_consumption(&self) -> f64;
    fn total_energy_production(&self) -> f64;
    fn current_power_production(&self) -> f64;
}

/// Map the outcome of [`Meter::process_telegram`] to the dispatcher contract.
/// Failures stay local to the telegram, they are only logged.
pub fn log_outcome(meter_type: MeterType, name: &str, outcome: Result<TelegramStatus, MeterError>) -> bool {
    match outcome {
        Ok(TelegramStatus::NotForMe) => false,
        Ok(TelegramStatus::Handled) => true,
        Err(e) => {
            warn!("({}) {name}: telegram dropped: {e}", meter_type.to_string());
            true
        }
    }
}

pub fn create_meter(bus: &Arc<WMBus>, config: &MeterConfig, options: MeterOptions) -> Result<Arc<dyn ElectricityMeter>, MeterError> {
    match MeterType::from_str(&config.driver) {
        Some(MeterType::Omnipower) => {
            let meter = MeterOmnipower::new(bus, &config.name, &config.id, &config.key, options, Box::new(DvParser))?;
            Ok(meter)
        }
        None => Err(MeterError::UnknownDriver(config.driver.clone())),
    }
}
