use serde::{Deserialize, Serialize};

use crate::sampler::ResourceSample;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthScoreConfig {
    /// CPU percentage at or above which the process counts as high-resource.
    pub cpu_threshold: f64,
    /// Memory percentage at or above which the process counts as high-resource.
    pub memory_threshold: f64,
}

impl Default for HealthScoreConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            memory_threshold: 70.0,
        }
    }
}

const ZOMBIE_PENALTY: i32 = 50;
const HIGH_RESOURCE_PENALTY: i32 = 20;
const STALE_PENALTY: i32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub is_alive: bool,
    pub is_zombie: bool,
    pub is_high_resource: bool,
    pub health_score: u8,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub sample: Option<ResourceSample>,
}

impl HealthMetrics {
    fn dead() -> Self {
        Self {
            is_alive: false,
            is_zombie: false,
            is_high_resource: false,
            health_score: 0,
            warnings: vec!["Process not found or not accessible".to_string()],
            recommendations: Vec::new(),
            sample: None,
        }
    }
}

/// Derive health from one resource sample. Pure: rules are applied
/// independently and additively against a base score of 100, clamped to
/// [0, 100]. A missing sample short-circuits to a dead verdict.
pub fn score(sample: Option<&ResourceSample>, config: &HealthScoreConfig) -> HealthMetrics {
    let Some(sample) = sample else {
        return HealthMetrics::dead();
    };

    let mut penalty = 0i32;
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    let is_zombie = sample.state.is_zombie();
    if is_zombie {
        penalty += ZOMBIE_PENALTY;
        warnings.push("Process is in zombie state".to_string());
        recommendations.push("Parent process should reap zombie child".to_string());
    }

    let high_cpu = sample.cpu_percent >= config.cpu_threshold;
    if high_cpu {
        penalty += HIGH_RESOURCE_PENALTY;
        warnings.push(format!("High CPU usage: {:.1}%", sample.cpu_percent));
    }
    let high_memory = sample.memory_percent >= config.memory_threshold;
    if high_memory {
        penalty += HIGH_RESOURCE_PENALTY;
        warnings.push(format!("High memory usage: {:.1}%", sample.memory_percent));
    }

    if !is_zombie && sample.cpu_percent == 0.0 && sample.memory_percent == 0.0 {
        penalty += STALE_PENALTY;
        warnings.push("Process appears stale or unresponsive (0% CPU, 0% memory)".to_string());
    }

    HealthMetrics {
        is_alive: true,
        is_zombie,
        is_high_resource: high_cpu || high_memory,
        health_score: (100i32 - penalty).clamp(0, 100) as u8,
        warnings,
        recommendations,
        sample: Some(sample.clone()),
    }
}

#[cfg(test)]
#[path = "../tests/unit/health_tests.rs"]
mod tests;
