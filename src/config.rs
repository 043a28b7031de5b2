use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::enforcer::ResourceLimitConfig;
use crate::health::HealthScoreConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::sampler::SamplerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Retries stop once one failure kind has repeated this many times.
    pub pattern_threshold: u32,
    /// Stdout lines starting with this prefix carry checkpoint payloads.
    pub checkpoint_marker: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pattern_threshold: 2,
            checkpoint_marker: "CHECKPOINT:".to_string(),
        }
    }
}

/// Whole supervision configuration, deserializable from a TOML file with
/// per-field defaults for anything omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub sampler: SamplerConfig,
    pub health: HealthScoreConfig,
    pub heartbeat: HeartbeatConfig,
    pub limits: ResourceLimitConfig,
    pub retry: RetryConfig,
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply per-task overrides over file values. Unset fields keep the
    /// file's (or default's) value.
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Self {
        let mut merged = self.clone();
        macro_rules! apply {
            ($($field:ident => $target:expr),* $(,)?) => {
                $(if let Some(value) = overrides.$field.clone() {
                    $target = value;
                })*
            };
        }
        if let Some(interval) = overrides.check_interval_ms {
            merged.sampler.check_interval_ms = interval;
            merged.limits.check_interval_ms = interval;
        }
        apply! {
            cpu_warn_percent => merged.limits.cpu_warn_percent,
            cpu_kill_percent => merged.limits.cpu_kill_percent,
            memory_warn_percent => merged.limits.memory_warn_percent,
            memory_kill_percent => merged.limits.memory_kill_percent,
            violation_threshold => merged.limits.violation_threshold,
            execution_timeout_ms => merged.limits.execution_timeout_ms,
            warning_timeout_ms => merged.limits.warning_timeout_ms,
            grace_period_ms => merged.limits.grace_period_ms,
            max_silence_ms => merged.heartbeat.max_silence_ms,
            analysis_window_ms => merged.heartbeat.analysis_window_ms,
            min_output_rate => merged.heartbeat.min_output_rate,
            min_progress_markers => merged.heartbeat.min_progress_markers,
            max_error_count => merged.heartbeat.max_error_count,
            heartbeat_cpu_threshold => merged.heartbeat.cpu_threshold,
            memory_threshold_mb => merged.heartbeat.memory_threshold_mb,
            max_attempts => merged.retry.max_attempts,
            pattern_threshold => merged.retry.pattern_threshold,
            checkpoint_marker => merged.retry.checkpoint_marker,
        }
        merged
    }
}

/// Per-task threshold overrides carried on a [`TaskSpec`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub check_interval_ms: Option<u64>,
    pub cpu_warn_percent: Option<f64>,
    pub cpu_kill_percent: Option<f64>,
    pub memory_warn_percent: Option<f64>,
    pub memory_kill_percent: Option<f64>,
    pub violation_threshold: Option<u32>,
    pub execution_timeout_ms: Option<u64>,
    pub warning_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub max_silence_ms: Option<u64>,
    pub analysis_window_ms: Option<u64>,
    pub min_output_rate: Option<f64>,
    pub min_progress_markers: Option<u32>,
    pub max_error_count: Option<u32>,
    pub heartbeat_cpu_threshold: Option<f64>,
    pub memory_threshold_mb: Option<f64>,
    pub max_attempts: Option<u32>,
    pub pattern_threshold: Option<u32>,
    pub checkpoint_marker: Option<String>,
}

/// One logical generation task handed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    /// Relative difficulty hint; scales the adaptive retry timeout.
    pub complexity: f64,
    pub overrides: ConfigOverrides,
}

impl TaskSpec {
    pub fn new(name: &str, program: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args,
            model: None,
            complexity: 1.0,
            overrides: ConfigOverrides::default(),
        }
    }
}
