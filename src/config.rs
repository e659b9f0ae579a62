//! Static configuration for the connectivity agent.
//!
//! Everything here is read once at startup. Missing or partial configuration
//! files degrade to defaults rather than preventing startup, so a freshly
//! flashed device comes up far enough to log what still needs to be filled in.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while locating or parsing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Credentials and interface for the wireless link.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct NetworkCredentials {
    /// Network SSID (Service Set Identifier)
    pub network: String,
    /// Network password/key
    pub key: String,
    /// Wireless interface the link lives on
    pub interface: String,
}

impl Default for NetworkCredentials {
    fn default() -> Self {
        Self {
            network: String::new(),
            key: String::new(),
            interface: "wlan0".to_string(),
        }
    }
}

/// The remote broker endpoint and session parameters.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct BrokerEndpoint {
    /// Broker hostname (no scheme, no port)
    pub host: String,
    /// Broker port; 8883 is the conventional TLS port
    pub port: u16,
    /// Username for broker authentication
    pub user: String,
    /// Password for broker authentication
    pub pw: String,
    /// Whether the session is established over TLS
    pub tls: bool,
    /// Maximum silence the broker tolerates before dropping the session
    pub keepalive_secs: u64,
    /// How often the supervisor emits an application-level liveness ping
    pub ping_interval_secs: u64,
    /// Topic the device subscribes to for inbound commands
    pub command_topic: String,
    /// Topic carrying availability announcements and heartbeats
    pub status_topic: String,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            user: String::new(),
            pw: String::new(),
            tls: true,
            keepalive_secs: 60,
            ping_interval_secs: 30,
            command_topic: "relaylink/commands".to_string(),
            status_topic: "relaylink/status".to_string(),
        }
    }
}

impl BrokerEndpoint {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// GPIO assignment for the two relay outputs.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct ActuatorPins {
    /// BCM pin driving the UP relay
    pub up_pin: u8,
    /// BCM pin driving the DOWN relay
    pub down_pin: u8,
    /// Relay boards that energize on a low level set this
    pub active_low: bool,
}

impl Default for ActuatorPins {
    fn default() -> Self {
        Self {
            up_pin: 17,
            down_pin: 27,
            active_low: false,
        }
    }
}

/// Retry budgets and pacing for the connection supervisor.
///
/// The constants are fixed and carry no jitter; the agent is a single
/// device talking to a private broker.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct SupervisorPolicy {
    /// Network join attempts before the failure is treated as fatal
    pub join_attempts: u32,
    /// Upper bound on a single join's association wait
    pub join_timeout_secs: u64,
    /// Poll cadence while waiting for association
    pub join_poll_ms: u64,
    /// Broker open+subscribe attempts per bring-up cycle
    pub broker_attempts: u32,
    /// Fixed delay between failed attempts
    pub retry_delay_secs: u64,
    /// Full bring-up cycles before the supervisor requests a restart
    pub max_bringup_cycles: u32,
    /// Yield between steady-state loop iterations
    pub loop_yield_ms: u64,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            join_attempts: 3,
            join_timeout_secs: 15,
            join_poll_ms: 500,
            broker_attempts: 3,
            retry_delay_secs: 2,
            max_bringup_cycles: 5,
            loop_yield_ms: 100,
        }
    }
}

impl SupervisorPolicy {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn join_poll(&self) -> Duration {
        Duration::from_millis(self.join_poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn loop_yield(&self) -> Duration {
        Duration::from_millis(self.loop_yield_ms)
    }
}

/// Top-level configuration, one section per subsystem.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkCredentials,
    pub broker: BrokerEndpoint,
    pub actuators: ActuatorPins,
    pub supervisor: SupervisorPolicy,
}

impl Config {
    /// Loads configuration from the first candidate path that exists.
    ///
    /// A missing file is not an error: the agent starts with defaults and
    /// logs where it looked. Unreadable or malformed files are errors, since
    /// silently ignoring a half-written config would be worse than refusing
    /// to start.
    pub fn load() -> Result<Self, ConfigError> {
        for path in Self::candidate_paths() {
            if !path.exists() {
                debug!("No configuration at {}", path.display());
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            info!("Loaded configuration from {}", path.display());
            return Ok(config);
        }

        warn!("No configuration file found, running with built-in defaults");
        Ok(Config::default())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("relaylink").join("relaylink.toml"));
        }
        paths.push(PathBuf::from("relaylink.toml"));
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.broker.port, 8883);
        assert!(config.broker.tls);
        assert_eq!(config.network.interface, "wlan0");
        assert_eq!(config.supervisor.broker_attempts, 3);
        assert_eq!(config.supervisor.max_bringup_cycles, 5);
        assert_eq!(config.supervisor.retry_delay(), Duration::from_secs(2));
    }

    #[test]
    fn full_file_parses() {
        let raw = r#"
            [network]
            network = "test2"
            key = "12345678"
            interface = "wlan1"

            [broker]
            host = "broker.example.net"
            port = 8883
            user = "device"
            pw = "secret"
            tls = true
            keepalive_secs = 45
            ping_interval_secs = 20
            command_topic = "house/shutter/commands"
            status_topic = "house/shutter/status"

            [actuators]
            up_pin = 5
            down_pin = 6
            active_low = true

            [supervisor]
            join_attempts = 4
            broker_attempts = 2
            max_bringup_cycles = 10
        "#;

        let config: Config = toml::from_str(raw).expect("parse");
        assert_eq!(config.network.network, "test2");
        assert_eq!(config.network.interface, "wlan1");
        assert_eq!(config.broker.keepalive(), Duration::from_secs(45));
        assert_eq!(config.broker.ping_interval(), Duration::from_secs(20));
        assert!(config.actuators.active_low);
        assert_eq!(config.supervisor.join_attempts, 4);
        assert_eq!(config.supervisor.broker_attempts, 2);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let raw = r#"
            [broker]
            host = "broker.example.net"
            user = "device"
            pw = "secret"
        "#;

        let config: Config = toml::from_str(raw).expect("parse");
        assert_eq!(config.broker.host, "broker.example.net");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.command_topic, "relaylink/commands");
        assert_eq!(config.network.interface, "wlan0");
        assert_eq!(config.supervisor.loop_yield_ms, 100);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config.actuators.up_pin, 17);
        assert_eq!(config.actuators.down_pin, 27);
        assert!(!config.actuators.active_low);
    }
}
