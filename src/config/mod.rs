use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::meters::{MeterOptions, MeterType};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to parse config: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("Unable to read the config on config/wmbus.yaml or wmbus.yaml")]
    NotFound,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn mqtt_port_default() -> u16 { 1883 }
fn mqtt_client_name_default() -> String { "wmbus2mqtt".to_string() }
fn mqtt_topic_prefix_default() -> String { "wmbus2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_topic_prefix_default")]
    pub topic_prefix: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    pub name: String,
    pub driver: String,
    pub id: String,
    /* 32 hex digits, empty for plaintext meters */
    #[serde(default)]
    pub key: String,
}

/// What the binary prints for every update
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    #[serde(rename="hr")]
    HumanReadable,
    #[serde(rename="fields")]
    Fields,
    #[serde(rename="json")]
    Json,
}

fn separator_default() -> String { ";".to_string() }
fn format_default() -> OutputFormat { OutputFormat::Json }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_telegrams: bool,
    #[serde(default)]
    pub frames_have_crc: bool,
    #[serde(default="separator_default")]
    pub separator: String,
    #[serde(default="format_default")]
    pub format: OutputFormat,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
    #[serde(default)]
    pub shell: Vec<String>,
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        c.validate()?;
        Ok(c)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let c = Config::from_str(&contents)?;
        info!("Config loaded from {}, {} meters", path.display(), c.meters.len());
        Ok(c)
    }

    /// Check the two default locations of the config file
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Config::default_paths()
            .into_iter()
            .find(|p| p.is_file())
            .ok_or(ConfigError::NotFound)?;
        Config::load(&path)
    }

    pub fn default_paths() -> Vec<PathBuf> {
        vec![PathBuf::from("config/wmbus.yaml"), PathBuf::from("wmbus.yaml")]
    }

    /// Reports the first offending entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let id_re = Regex::new(r"^[0-9a-fA-F]{8}$").map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let key_re = Regex::new(r"^([0-9a-fA-F]{32})?$").map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.separator.chars().count() != 1 {
            return Err(ConfigError::Invalid(format!("separator must be a single character, got {:?}", self.separator)));
        }

        let mut names = HashSet::new();
        for m in &self.meters {
            if MeterType::from_str(&m.driver).is_none() {
                return Err(ConfigError::Invalid(format!("meter {}: unknown driver {}", m.name, m.driver)));
            }
            if !id_re.is_match(&m.id) {
                return Err(ConfigError::Invalid(format!("meter {}: id {} is not 8 hex digits", m.name, m.id)));
            }
            if !key_re.is_match(&m.key) {
                return Err(ConfigError::Invalid(format!("meter {}: key must be empty or 32 hex digits", m.name)));
            }
            /* Names are used for MQTT topics */
            if !names.insert(m.name.as_str()) {
                return Err(ConfigError::Invalid(format!("meter {} configured twice", m.name)));
            }
            debug!("Meter {} ({}) {} configured", m.name, m.driver, m.id);
        }

        Ok(())
    }

    pub fn separator(&self) -> char {
        self.separator.chars().next().unwrap_or(';')
    }

    pub fn options(&self) -> MeterOptions {
        MeterOptions {
            verbose: self.verbose,
            debug: self.debug,
            log_telegrams: self.log_telegrams,
        }
    }
}
