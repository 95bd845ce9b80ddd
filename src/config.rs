//! Configuration management

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-facing TLS relay
    pub relay: RelayConfig,
    /// Ports handed to backends
    pub ports: PortRangeConfig,
    /// Per-connection outstation backends
    pub backend: BackendConfig,
    /// Tenant configuration and telemetry sources
    pub store: StoreConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Environment variables use the `OUTSTATION_BROKER_` prefix with `__`
    /// separating nested keys, e.g. `OUTSTATION_BROKER_RELAY__PORT=8443`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("OUTSTATION_BROKER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let ports = &self.ports;
        if ports.first == 0 || ports.last < ports.first {
            return Err(Error::Config(format!(
                "ports: invalid range {}..={}",
                ports.first, ports.last
            )));
        }
        if (ports.first..=ports.last).contains(&self.relay.port) {
            return Err(Error::Config(format!(
                "relay.port {} lies inside the backend port range",
                self.relay.port
            )));
        }
        if self.backend.max_frame_length == 0 {
            return Err(Error::Config(
                "backend.max_frame_length must be positive".to_string(),
            ));
        }
        if self.backend.instruction_topic.trim().is_empty() {
            return Err(Error::Config(
                "backend.instruction_topic must not be empty".to_string(),
            ));
        }
        if self.store.instruction_capacity == 0 {
            return Err(Error::Config(
                "store.instruction_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// PEM certificate chain presented to clients
    pub server_cert: Option<PathBuf>,
    /// PEM private key for `server_cert`
    pub server_key: Option<PathBuf>,
    /// Time allowed for the TLS handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 20000,
            server_cert: None,
            server_key: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Inclusive range of ports reserved for backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRangeConfig {
    /// First port of the range
    pub first: u16,
    /// Last port of the range (inclusive)
    pub last: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            first: 30000,
            last: 30999,
        }
    }
}

/// Outstation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Address backends bind to; also the relay's destination host
    pub bind_host: IpAddr,
    /// Longest request line accepted by a backend (bytes)
    pub max_frame_length: usize,
    /// Queue topic for control instructions
    pub instruction_topic: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_frame_length: 8 * 1024,
            instruction_topic: "outstation/operate".to_string(),
        }
    }
}

/// Data source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Tenant configuration document (YAML)
    pub tenants: PathBuf,
    /// Optional telemetry seed (YAML list of readings)
    pub telemetry_seed: Option<PathBuf>,
    /// Maximum queued instructions
    pub instruction_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tenants: PathBuf::from("tenants.yaml"),
            telemetry_seed: None,
            instruction_capacity: 1024,
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape address; exporter disabled when unset
    pub listen: Option<SocketAddr>,
}

/// Human-readable `Duration` (de)serialization: `"250ms"`, `"10s"`, `"5m"`,
/// or a bare number of seconds.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as whole seconds when possible, else milliseconds.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a duration string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(raw: &str) -> Result<Duration, String> {
        let s = raw.trim();
        let number = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{raw}': {e}"))
        };
        // "ms" must be checked before "s".
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
