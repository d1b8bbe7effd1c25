// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration for the DMRHub routing plane.
//!
//! Loaded from environment variables by the `dmrhub-server` binary and
//! passed down to the transports, Hub, CallTracker and NetScheduler.
//! Every field has a documented default matching spec section 6.4.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HBRP (MMDVM/HomeBrew) UDP listen port.
    #[serde(default = "default_hbrp_port")]
    pub hbrp_port: u16,

    /// IPSC UDP listen port.
    #[serde(default = "default_ipsc_port")]
    pub ipsc_port: u16,

    /// OpenBridge UDP listen port.
    #[serde(default = "default_openbridge_port")]
    pub openbridge_port: u16,

    /// Bind address for all transports.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Seconds without `RPTPING`/alive before a repeater session is torn down.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Seconds the RPTL/RPTK handshake has to complete.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Minutes of inactivity before a dynamic talkgroup assignment decays.
    #[serde(default = "default_dynamic_ttl_minutes")]
    pub dynamic_ttl_minutes: u64,

    /// Maximum buffered bursts per in-flight Parrot stream.
    #[serde(default = "default_max_parrot_bursts")]
    pub max_parrot_bursts: usize,

    /// Reject repeater IDs that are not present in the repository.
    #[serde(default)]
    pub disable_radio_id_validation: bool,

    /// Relational store connection string (sqlite path or DSN).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Log level passed to `tracing_subscriber::EnvFilter`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_hbrp_port() -> u16 {
    62031
}
fn default_ipsc_port() -> u16 {
    50000
}
fn default_openbridge_port() -> u16 {
    62035
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_ping_timeout_secs() -> u64 {
    90
}
fn default_handshake_timeout_secs() -> u64 {
    5
}
fn default_dynamic_ttl_minutes() -> u64 {
    10
}
fn default_max_parrot_bursts() -> usize {
    4096
}
fn default_database_url() -> String {
    "dmrhub.sqlite3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hbrp_port: default_hbrp_port(),
            ipsc_port: default_ipsc_port(),
            openbridge_port: default_openbridge_port(),
            bind_address: default_bind_address(),
            ping_timeout_secs: default_ping_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dynamic_ttl_minutes: default_dynamic_ttl_minutes(),
            max_parrot_bursts: default_max_parrot_bursts(),
            disable_radio_id_validation: false,
            database_url: default_database_url(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("DMRHUB_HBRP_PORT") {
            if let Ok(port) = v.parse() {
                config.hbrp_port = port;
            }
        }
        if let Ok(v) = std::env::var("DMRHUB_IPSC_PORT") {
            if let Ok(port) = v.parse() {
                config.ipsc_port = port;
            }
        }
        if let Ok(v) = std::env::var("DMRHUB_OPENBRIDGE_PORT") {
            if let Ok(port) = v.parse() {
                config.openbridge_port = port;
            }
        }
        if let Ok(v) = std::env::var("DMRHUB_BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Ok(v) = std::env::var("DMRHUB_PING_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.ping_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DMRHUB_DATABASE_URL") {
            config.database_url = v;
        }
        if let Ok(v) = std::env::var("DMRHUB_LOG_LEVEL") {
            config.log_level = v;
        }
        if let Ok(v) = std::env::var("DMRHUB_DISABLE_RADIO_ID_VALIDATION") {
            config.disable_radio_id_validation = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Validate the configuration, returning a descriptive error on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hbrp_port == 0 || self.ipsc_port == 0 || self.openbridge_port == 0 {
            return Err(ConfigError::Invalid(
                "transport ports must be non-zero".into(),
            ));
        }
        let ports = [self.hbrp_port, self.ipsc_port, self.openbridge_port];
        for (i, a) in ports.iter().enumerate() {
            for b in &ports[i + 1..] {
                if a == b {
                    return Err(ConfigError::Invalid(format!(
                        "transport ports must be distinct, got duplicate port {}",
                        a
                    )));
                }
            }
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::Invalid("database_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dynamic_ttl(&self) -> Duration {
        Duration::from_secs(self.dynamic_ttl_minutes * 60)
    }
}

/// Reserved destination ID that triggers Parrot echo (spec section 4.5, GLOSSARY).
pub const PARROT_TALKGROUP_ID: u32 = 9990;

/// Parrot playback cadence between re-transmitted bursts (spec section 4.5 item 2).
pub const PARROT_BURST_INTERVAL: Duration = Duration::from_millis(60);

/// TTL for the last-heard-repeater record used by private-call routing (spec section 6.3).
pub const LASTHEARD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for the per-repeater distributed session lock (spec section 6.3).
pub const REPEATER_SESSION_LOCK_TTL: Duration = Duration::from_secs(120);

/// TTL for a scheduled-net election lock (spec section 4.7 step 1).
pub const NETSCHEDULER_LOCK_TTL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let mut config = Config::default();
        config.ipsc_port = config.hbrp_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = Config {
            hbrp_port: 0,
            ..Config::default()
        };
        config.hbrp_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_database_url_rejected() {
        let config = Config {
            database_url: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_ports_match_spec() {
        let config = Config::default();
        assert_eq!(config.hbrp_port, 62031);
        assert_eq!(config.ipsc_port, 50000);
        assert_eq!(config.openbridge_port, 62035);
    }
}
