//! Receiver configuration
//!
//! Every timeout and capacity used by the protocols and the orchestrator
//! lives here. All sections deserialize from TOML with per-field defaults,
//! so a config file only needs to name the values it overrides.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level receiver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Join/Listen/Leave handshake and socket settings
    pub protocol: ProtocolConfig,
    /// Latency and frame repair policy
    pub repair: RepairConfig,
    /// Zone discovery settings
    pub zone: ZoneConfig,
}

impl ReceiverConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("protocol.join_timeout_ms", self.protocol.join_timeout_ms),
            ("protocol.listen_timeout_ms", self.protocol.listen_timeout_ms),
            ("protocol.leave_timeout_ms", self.protocol.leave_timeout_ms),
            ("protocol.read_timeout_ms", self.protocol.read_timeout_ms),
            ("repair.default_latency_ms", self.repair.default_latency_ms as u64),
            ("repair.repair_timeout_ms", self.repair.repair_timeout_ms),
            ("zone.query_interval_ms", self.zone.query_interval_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        if self.protocol.max_slaves > MAX_SLAVE_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "protocol.max_slaves",
                reason: format!("at most {} slaves are supported", MAX_SLAVE_CAPACITY),
            });
        }

        if self.repair.playing_after_frames == 0 {
            return Err(ConfigError::Invalid {
                field: "repair.playing_after_frames",
                reason: "must count at least the baseline frame".into(),
            });
        }

        Ok(())
    }
}

/// Protocol handshake configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Delay between joining a multicast group and the first Join
    pub membership_delay_ms: u64,
    /// Join is re-sent at this interval until stream traffic arrives
    pub join_timeout_ms: u64,
    /// Listen keepalive interval
    pub listen_timeout_ms: u64,
    /// Upper bound on the unicast Leave handshake
    pub leave_timeout_ms: u64,
    /// Socket read timeout; bounds how quickly a read loop notices stop
    pub read_timeout_ms: u64,
    /// Unicast relay capacity
    pub max_slaves: usize,
    /// Receive buffer size requested from the OS
    pub recv_buffer_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            membership_delay_ms: DEFAULT_MEMBERSHIP_DELAY_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            listen_timeout_ms: DEFAULT_LISTEN_TIMEOUT_MS,
            leave_timeout_ms: DEFAULT_LEAVE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_slaves: DEFAULT_MAX_SLAVES,
            recv_buffer_bytes: 256 * 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn membership_delay(&self) -> Duration {
        Duration::from_millis(self.membership_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// How long each phase of a stop waits for the read loop to wind down
    ///
    /// A unicast loop exits at its leave deadline and a multicast one within
    /// a read timeout, so this only runs out for a stuck session.
    pub fn stop_bound(&self) -> Duration {
        self.leave_timeout() + self.read_timeout()
    }
}

/// Latency and repair configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Latency used when the first audio frame declares none
    pub default_latency_ms: u32,
    /// Upper bound on how long a gap may stay open
    pub repair_timeout_ms: u64,
    /// Delay before the first re-request; doubles per retry
    pub resend_backoff_ms: u64,
    /// Extra resend requests per gap after the first one
    pub resend_retries: u32,
    /// Backward jump treated as a sender restart
    pub discontinuity_frames: u32,
    /// Forward gaps wider than this are skipped instead of repaired
    pub max_repair_frames: u32,
    /// Contiguous frames from the baseline (inclusive) before Playing
    pub playing_after_frames: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            default_latency_ms: DEFAULT_LATENCY_MS,
            repair_timeout_ms: DEFAULT_REPAIR_TIMEOUT_MS,
            resend_backoff_ms: DEFAULT_RESEND_BACKOFF_MS,
            resend_retries: DEFAULT_RESEND_RETRIES,
            discontinuity_frames: DEFAULT_DISCONTINUITY_FRAMES,
            max_repair_frames: DEFAULT_MAX_REPAIR_FRAMES,
            playing_after_frames: 2,
        }
    }
}

impl RepairConfig {
    pub fn repair_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_timeout_ms)
    }

    pub fn resend_backoff(&self) -> Duration {
        Duration::from_millis(self.resend_backoff_ms)
    }
}

/// Zone discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Discovery group for zone uris that name no host
    pub address: Ipv4Addr,
    /// Discovery port for zone uris that name none
    pub port: u16,
    /// Interval between zone queries
    pub query_interval_ms: u64,
    /// Queries sent before falling back to passive listening
    pub query_retries: u32,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ZONE_ADDRESS,
            port: DEFAULT_ZONE_PORT,
            query_interval_ms: DEFAULT_ZONE_QUERY_INTERVAL_MS,
            query_retries: DEFAULT_ZONE_QUERY_RETRIES,
        }
    }
}

impl ZoneConfig {
    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms)
    }
}
