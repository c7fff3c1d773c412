//! Pipeline configuration. Every section has serde defaults so a JSON file
//! only needs the fields it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::adapters::SourceConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::fusion::FusionConfig;
use crate::health::ReconnectPolicy;
use crate::normalizer::AliasTable;
use crate::types::SourceKind;

// ─── Poll / health timing ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_period_ms: u64,
    pub health_period_ms: u64,

    pub can_read_timeout_ms: u64,
    pub gps_read_timeout_ms: u64,
    pub imu_read_timeout_ms: u64,
    /// Extra non-blocking reads per adapter per tick after the first
    pub max_drain_per_tick: usize,
    pub parallel_reads: bool,

    pub close_timeout_ms: u64,
    pub stop_grace_ms: u64,

    pub subscriber_queue_depth: usize,

    // ── Reconnect back-off ──
    pub reconnect_base_cooldown_ms: u64,
    pub reconnect_max_cooldown_ms: u64,
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_attempts: u32,

    // ── Silence thresholds ──
    pub can_silence_ms: u64,
    pub gps_silence_ms: u64,
    pub imu_silence_ms: u64,

    /// Source id the fused estimate is published under
    pub fusion_source_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: 100,
            health_period_ms: 1000,
            can_read_timeout_ms: 50,
            gps_read_timeout_ms: 200,
            imu_read_timeout_ms: 200,
            max_drain_per_tick: 32,
            parallel_reads: true,
            close_timeout_ms: 1000,
            stop_grace_ms: 2000,
            subscriber_queue_depth: 16,
            reconnect_base_cooldown_ms: 2000,
            reconnect_max_cooldown_ms: 30_000,
            reconnect_backoff_factor: 1.5,
            max_reconnect_attempts: 60,
            can_silence_ms: 5000,
            gps_silence_ms: 30_000,
            imu_silence_ms: 5000,
            fusion_source_id: "fusion".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn health_period(&self) -> Duration {
        Duration::from_millis(self.health_period_ms)
    }

    pub fn read_timeout(&self, kind: SourceKind) -> Duration {
        Duration::from_millis(match kind {
            SourceKind::Can => self.can_read_timeout_ms,
            SourceKind::Gps => self.gps_read_timeout_ms,
            SourceKind::Imu => self.imu_read_timeout_ms,
        })
    }

    pub fn silence_threshold(&self, kind: SourceKind) -> Duration {
        Duration::from_millis(match kind {
            SourceKind::Can => self.can_silence_ms,
            SourceKind::Gps => self.gps_silence_ms,
            SourceKind::Imu => self.imu_silence_ms,
        })
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_cooldown: Duration::from_millis(self.reconnect_base_cooldown_ms),
            max_cooldown: Duration::from_millis(self.reconnect_max_cooldown_ms),
            backoff_factor: self.reconnect_backoff_factor,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let nonzero = [
            ("poll_period_ms", self.poll_period_ms),
            ("health_period_ms", self.health_period_ms),
            ("can_read_timeout_ms", self.can_read_timeout_ms),
            ("gps_read_timeout_ms", self.gps_read_timeout_ms),
            ("imu_read_timeout_ms", self.imu_read_timeout_ms),
            ("stop_grace_ms", self.stop_grace_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.close_timeout_ms > self.stop_grace_ms {
            return Err(ConfigError::InvalidParameter {
                name: "close_timeout_ms",
                reason: format!(
                    "{} exceeds the stop grace period ({})",
                    self.close_timeout_ms, self.stop_grace_ms
                ),
            });
        }
        if self.subscriber_queue_depth == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "subscriber_queue_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.reconnect_backoff_factor.is_nan() || self.reconnect_backoff_factor < 1.0 {
            return Err(ConfigError::InvalidParameter {
                name: "reconnect_backoff_factor",
                reason: format!("must be >= 1.0, got {}", self.reconnect_backoff_factor),
            });
        }
        if self.fusion_source_id.trim().is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "fusion_source_id",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ─── Bundle ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub pipeline: PipelineConfig,
    pub fusion: FusionConfig,
    pub aliases: AliasTable,
    pub sources: Vec<SourceConfig>,
}

impl TelemetryConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TelemetryConfig =
            serde_json::from_str(json).context("Failed to parse telemetry config")?;
        config.validate().context("Invalid telemetry config")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("In {}", path.display()))
    }

    /// Ids of every configured source, in declaration order.
    pub fn expected_source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|s| s.source_ids())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.pipeline.validate()?;
        self.fusion.validate()?;
        self.aliases.validate()?;

        let mut seen = HashSet::new();
        for id in self.expected_source_ids() {
            if id == self.pipeline.fusion_source_id || !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateSource(id));
            }
        }
        Ok(())
    }
}
