//! Bench configuration.
//!
//! Values come from the built-in defaults, then `bench.toml` (or the file given on
//! the command line), then `BENCH_` environment variables, the last source
//! winning. Nested keys use `__` in variable names, e.g.
//! `BENCH_RELAY__DISCOVERY__SUFFIX_LEN=2`.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryConfig;
use crate::error::{BenchError, Result};
use crate::flasher::FlasherConfig;
use crate::multimeter::ModeTable;
use crate::power_supply::SupplyLimits;
use crate::relay_bank::RelayTiming;

pub const DEFAULT_CONFIG_FILE: &str = "bench.toml";
pub const ENV_PREFIX: &str = "BENCH_";

/// Durations are written as whole milliseconds in configuration files.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub discovery: DiscoveryConfig,
    pub timing: RelayTiming,
    /// Port scans before giving up on missing boards.
    pub discovery_attempts: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            timing: RelayTiming::default(),
            discovery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultimeterConfig {
    pub modes: ModeTable,
    /// Wait before trusting the latest measurement after a bench change.
    #[serde(with = "millis")]
    pub settle: Duration,
    /// Timeout of a single USB read.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// How long a meter gets to deliver its first frame at start-up.
    #[serde(with = "millis")]
    pub startup_timeout: Duration,
}

impl Default for MultimeterConfig {
    fn default() -> Self {
        Self {
            modes: ModeTable::default(),
            settle: Duration::from_millis(500),
            read_timeout: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSupplyConfig {
    pub vid_pid: String,
    pub limits: SupplyLimits,
}

impl Default for PowerSupplyConfig {
    fn default() -> Self {
        Self {
            vid_pid: String::from("VID:PID=0416:5011"),
            limits: SupplyLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub log_level: String,
    pub relay: RelayConfig,
    pub multimeter: MultimeterConfig,
    pub power_supply: PowerSupplyConfig,
    pub flasher: FlasherConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            log_level: String::from("info"),
            relay: RelayConfig::default(),
            multimeter: MultimeterConfig::default(),
            power_supply: PowerSupplyConfig::default(),
            flasher: FlasherConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Layered sources: defaults, then the TOML file, then the environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: BenchConfig = figment
            .extract()
            .map_err(|e| BenchError::Config(format!("failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let discovery = &self.relay.discovery;
        if !(1..=2).contains(&discovery.suffix_len) {
            return Err(BenchError::Config(format!(
                "relay.discovery.suffix_len must be 1 or 2, got {}",
                discovery.suffix_len
            )));
        }
        if discovery.labels.is_empty() {
            return Err(BenchError::Config(String::from("relay.discovery.labels is empty")));
        }
        for (i, label) in discovery.labels.iter().enumerate() {
            if label.len() != discovery.suffix_len {
                return Err(BenchError::Config(format!(
                    "relay board label '{}' does not have {} character(s)",
                    label, discovery.suffix_len
                )));
            }
            if discovery.labels[..i].contains(label) {
                return Err(BenchError::Config(format!("relay board label '{}' is listed twice", label)));
            }
        }
        if discovery.vid_pid.trim().is_empty() {
            return Err(BenchError::Config(String::from("relay.discovery.vid_pid is empty")));
        }
        let codes = self.multimeter.modes.codes();
        for (i, (mode, code)) in codes.iter().enumerate() {
            if let Some((other, _)) = codes[..i].iter().find(|(_, c)| c == code) {
                return Err(BenchError::Config(format!(
                    "multimeter.modes.{} and multimeter.modes.{} share code {}",
                    other, mode, code
                )));
            }
        }
        Ok(())
    }
}
