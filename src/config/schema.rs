use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Well-known port that external clients send to
pub const DEFAULT_CLIENT_PORT: u16 = 62000;

/// Largest datagram read in one receive
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Main relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// IP the client-facing socket binds to
    pub bind_address: String,
    /// Client-facing UDP port
    pub client_port: u16,
    /// IP for the pipeline-facing socket and the internal endpoints
    pub internal_address: String,
    /// Receive buffer size in bytes
    pub buffer_size: usize,
    /// A client silent for longer than this is evicted (milliseconds)
    pub idle_timeout_ms: u64,
    /// Time between idle sweeps (milliseconds)
    pub sweep_interval_ms: u64,
    /// Width of one grid cell in the composited output
    pub tile_width: u32,
    /// Height of one grid cell in the composited output
    pub tile_height: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            internal_address: "127.0.0.1".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout_ms: 2000,
            sweep_interval_ms: 8000,
            tile_width: 320,
            tile_height: 240,
        }
    }
}

impl RelayConfig {
    /// Idle threshold as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Sweep interval as a `Duration`
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn bind_ip(&self) -> Result<IpAddr> {
        parse_ip("bind_address", &self.bind_address)
    }

    pub fn internal_ip(&self) -> Result<IpAddr> {
        parse_ip("internal_address", &self.internal_address)
    }

    /// Check the configuration before any socket is bound
    pub fn validate(&self) -> Result<()> {
        self.bind_ip()?;
        self.internal_ip()?;

        if self.buffer_size == 0 || self.buffer_size > u16::MAX as usize {
            return Err(RelayError::Config(format!(
                "buffer_size must be between 1 and {}, got {}",
                u16::MAX,
                self.buffer_size
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(RelayError::Config(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(RelayError::Config(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(RelayError::Config(format!(
                "tile size must be non-zero, got {}x{}",
                self.tile_width, self.tile_height
            )));
        }
        Ok(())
    }
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("Invalid {}: {}", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_port, 62000);
        assert_eq!(config.idle_timeout(), Duration::from_secs(2));
        assert_eq!(config.sweep_interval(), Duration::from_secs(8));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"client_port": 5000, "idle_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.client_port, 5000);
        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.tile_width, 320);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.bind_address = "not-an-ip".to_string();
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));

        let mut config = RelayConfig::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.buffer_size = 70_000;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.sweep_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.idle_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.tile_height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ipv6_addresses_parse() {
        let mut config = RelayConfig::default();
        config.bind_address = "::".to_string();
        config.internal_address = " ::1 ".to_string();
        assert!(config.validate().is_ok());
        assert!(config.internal_ip().unwrap().is_loopback());
    }
}
