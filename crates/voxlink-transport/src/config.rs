//! # Transport Configuration
//!
//! Two layers: a permissive `TransportConfigInput` deserialized from TOML with
//! every field optional, and a validated `TransportConfig` the rest of the
//! crate consumes.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::ConfigError;

// ─── Input (TOML) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub reorder_capacity: Option<usize>,
    pub max_command_size: Option<usize>,
    pub generation_window: Option<u32>,
    pub acknowledge_overflow: Option<bool>,
    pub initial_rto_ms: Option<u64>,
    pub min_rto_ms: Option<u64>,
    pub max_resend_interval_ms: Option<u64>,
    pub resend_budget: Option<u32>,
    pub resend_timeout_ms: Option<u64>,
    pub ack_linger_rto_factor: Option<u32>,
    pub compression_threshold: Option<usize>,
    pub max_fragment_payload: Option<usize>,
    pub buffer_pool_capacity: Option<usize>,
    pub statistics_interval_ms: Option<u64>,
}

// ─── Resolved Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Slots per command reorder buffer. Power of two.
    pub reorder_capacity: usize,
    /// Largest decompressed command accepted before the connection is failed.
    pub max_command_size: usize,
    /// Width of the low/high wire id bands used for wrap detection.
    pub generation_window: u32,
    /// Acknowledge command ids whose reorder insert overflowed.
    pub acknowledge_overflow: bool,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    /// Upper bound on the spacing between two resends of one packet.
    pub max_resend_interval: Duration,
    pub resend_budget: u32,
    pub resend_timeout: Duration,
    /// Acknowledged entries linger this many RTOs before they are collected.
    pub ack_linger_rto_factor: u32,
    pub compression_threshold: usize,
    pub max_fragment_payload: usize,
    pub buffer_pool_capacity: usize,
    pub statistics_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reorder_capacity: 64,
            max_command_size: 64 * 1024 * 1024,
            generation_window: 8192,
            acknowledge_overflow: true,
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(200),
            max_resend_interval: Duration::from_millis(1500),
            resend_budget: 15,
            resend_timeout: Duration::from_millis(15_000),
            ack_linger_rto_factor: 4,
            compression_threshold: 100,
            max_fragment_payload: 487,
            buffer_pool_capacity: 64,
            statistics_interval: Duration::from_millis(15_000),
        }
    }
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, ConfigError> {
        let d = TransportConfig::default();
        let ms = |v: Option<u64>, fallback: Duration| {
            v.map(Duration::from_millis).unwrap_or(fallback)
        };

        let cfg = TransportConfig {
            reorder_capacity: self.reorder_capacity.unwrap_or(d.reorder_capacity),
            max_command_size: self.max_command_size.unwrap_or(d.max_command_size),
            generation_window: self.generation_window.unwrap_or(d.generation_window),
            acknowledge_overflow: self.acknowledge_overflow.unwrap_or(d.acknowledge_overflow),
            initial_rto: ms(self.initial_rto_ms, d.initial_rto),
            min_rto: ms(self.min_rto_ms, d.min_rto),
            max_resend_interval: ms(self.max_resend_interval_ms, d.max_resend_interval),
            resend_budget: self.resend_budget.unwrap_or(d.resend_budget),
            resend_timeout: ms(self.resend_timeout_ms, d.resend_timeout),
            ack_linger_rto_factor: self.ack_linger_rto_factor.unwrap_or(d.ack_linger_rto_factor),
            compression_threshold: self.compression_threshold.unwrap_or(d.compression_threshold),
            max_fragment_payload: self.max_fragment_payload.unwrap_or(d.max_fragment_payload),
            buffer_pool_capacity: self.buffer_pool_capacity.unwrap_or(d.buffer_pool_capacity),
            statistics_interval: ms(self.statistics_interval_ms, d.statistics_interval),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reorder_capacity < 2 || !self.reorder_capacity.is_power_of_two() {
            return Err(ConfigError::ReorderCapacity(self.reorder_capacity));
        }
        if self.generation_window == 0 || self.generation_window > 0x7FFF {
            return Err(ConfigError::GenerationWindow(self.generation_window));
        }
        if self.max_fragment_payload == 0 {
            return Err(ConfigError::FragmentPayload);
        }
        if self.max_command_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_command_size",
            });
        }
        if self.initial_rto.is_zero() {
            return Err(ConfigError::Zero {
                field: "initial_rto_ms",
            });
        }
        if self.max_resend_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "max_resend_interval_ms",
            });
        }
        if self.statistics_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "statistics_interval_ms",
            });
        }
        Ok(())
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input)
            .map_err(|e| ConfigError::Parse(format!("Invalid config TOML: {}", e)))?;
        parsed.resolve()
    }
}

/// Read and resolve a TOML config file.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<TransportConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading transport config {}", path.display()))?;
    let cfg = TransportConfig::from_toml_str(&raw)
        .with_context(|| format!("parsing transport config {}", path.display()))?;
    Ok(cfg)
}
