use anyhow::{bail, Context, Result};
#[cfg(test)]
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::time::Duration;

use crate::rtp::jitter::{JitterBufferConfig, DEFAULT_CAPACITY, DEFAULT_TARGET_JITTER_MS};
use crate::rtp::receiver::ReceiverConfig;

#[derive(Debug, Clone)]
pub struct Config {
    // Network
    pub rtp_bind_addr: String,
    /// 0 lets the OS pick a port
    pub rtp_port: u16,

    // Jitter buffer
    pub jitter_target_ms: i64,
    pub jitter_capacity: usize,

    // Media format
    pub clock_rate: u32,
    pub playout_interval_ms: u64,

    // Health check HTTP server port (optional, disabled if not set)
    // When set, exposes /health, /ready, and /metrics endpoints
    pub health_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            rtp_bind_addr: get("RTP_BIND_ADDR")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            rtp_port: get("RTP_PORT")
                .unwrap_or_else(|| "0".to_string())
                .parse()
                .context("RTP_PORT must be a valid port number")?,

            jitter_target_ms: get("JITTER_TARGET_MS")
                .map(|s| s.parse::<i64>())
                .transpose()
                .context("JITTER_TARGET_MS must be a number of milliseconds")?
                .unwrap_or(DEFAULT_TARGET_JITTER_MS),
            jitter_capacity: get("JITTER_CAPACITY")
                .map(|s| s.parse::<usize>())
                .transpose()
                .context("JITTER_CAPACITY must be a slot count")?
                .unwrap_or(DEFAULT_CAPACITY),

            clock_rate: get("CLOCK_RATE")
                .map(|s| s.parse::<u32>())
                .transpose()
                .context("CLOCK_RATE must be a rate in Hz")?
                .unwrap_or(8000),
            playout_interval_ms: get("PLAYOUT_INTERVAL_MS")
                .map(|s| s.parse::<u64>())
                .transpose()
                .context("PLAYOUT_INTERVAL_MS must be a number of milliseconds")?
                .unwrap_or(20),

            health_port: get("HEALTH_PORT").and_then(|s| s.parse().ok()),
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.rtp_bind_addr.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "RTP_BIND_ADDR '{}' is not an IP address.",
                self.rtp_bind_addr
            ));
        }

        if self.jitter_capacity < 2 {
            errors.push(format!(
                "JITTER_CAPACITY={} must be at least 2.",
                self.jitter_capacity
            ));
        }

        if self.clock_rate == 0 {
            errors.push("CLOCK_RATE must be greater than 0.".to_string());
        }

        if self.playout_interval_ms == 0 || self.playout_interval_ms > 1000 {
            errors.push(format!(
                "PLAYOUT_INTERVAL_MS={} must be between 1 and 1000.",
                self.playout_interval_ms
            ));
        }

        if self.jitter_target_ms < 0 {
            errors.push("JITTER_TARGET_MS cannot be negative.".to_string());
        } else {
            // The ring can never hold more media than this
            let ceiling = (self.jitter_capacity as u64).saturating_mul(self.playout_interval_ms);
            if self.jitter_target_ms as u64 >= ceiling {
                errors.push(format!(
                    "JITTER_TARGET_MS={} cannot be reached with {} slots of {} ms.",
                    self.jitter_target_ms, self.jitter_capacity, self.playout_interval_ms
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    /// Socket address string for the RTP receiver
    pub fn rtp_bind_address(&self) -> String {
        match self.rtp_bind_addr.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{}]:{}", addr, self.rtp_port),
            _ => format!("{}:{}", self.rtp_bind_addr, self.rtp_port),
        }
    }

    pub fn jitter_config(&self) -> JitterBufferConfig {
        JitterBufferConfig {
            target_jitter_ms: self.jitter_target_ms,
            capacity: self.jitter_capacity,
        }
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            clock_rate: self.clock_rate,
            playout_interval: Duration::from_millis(self.playout_interval_ms),
        }
    }
}
