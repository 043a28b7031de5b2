use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::classifier::StderrClassifier;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Only events newer than this contribute to a snapshot.
    pub analysis_window_ms: u64,
    /// Silence longer than this is one of the stall signals.
    pub max_silence_ms: u64,
    /// Output events per second below which the stream counts as idle.
    pub min_output_rate: f64,
    /// Progress markers required inside the window to count as progressing.
    pub min_progress_markers: u32,
    /// Classified errors tolerated before the task counts as unhealthy.
    pub max_error_count: u32,
    pub cpu_threshold: f64,
    pub memory_threshold_mb: f64,
    /// Extra substrings that count as progress, on top of the built-in
    /// activity detection.
    pub progress_marker_patterns: Vec<String>,
    /// Substrings that mean the subprocess is blocked on a prompt.
    pub input_prompt_patterns: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            analysis_window_ms: 60_000,
            max_silence_ms: 120_000,
            min_output_rate: 0.01,
            min_progress_markers: 1,
            max_error_count: 5,
            cpu_threshold: 90.0,
            memory_threshold_mb: 2_048.0,
            progress_marker_patterns: Vec::new(),
            input_prompt_patterns: vec![
                "waiting for input".to_string(),
                "press enter".to_string(),
                "continue? [y/n]".to_string(),
                "(y/n)".to_string(),
                "password:".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    /// Output events per second across the analysis window.
    pub output_rate: f64,
    pub last_output_at_ms: Option<u64>,
    pub error_count: u32,
    pub process_runtime_ms: u64,
    pub progress_marker_count: u32,
    pub is_waiting_for_input: bool,
    /// Timestamp the snapshot was taken at, for silence math downstream.
    pub taken_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthVerdict {
    pub is_healthy: bool,
    pub should_terminate: bool,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

/// Per-task accumulator for output activity, progress markers, classified
/// error volume, and the latest resource reading. One tracker per task;
/// dropped when the task ends.
#[derive(Debug)]
pub struct HeartbeatTracker {
    config: HeartbeatConfig,
    started_at_ms: u64,
    output_events: VecDeque<u64>,
    progress_markers: VecDeque<u64>,
    error_count: u32,
    last_output_at_ms: Option<u64>,
    cpu_percent: f64,
    memory_mb: f64,
    waiting_for_input: bool,
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig, now_ms: u64) -> Self {
        Self {
            config,
            started_at_ms: now_ms,
            output_events: VecDeque::new(),
            progress_markers: VecDeque::new(),
            error_count: 0,
            last_output_at_ms: None,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            waiting_for_input: false,
        }
    }

    /// Record one line of subprocess output. Prompt-looking lines flip the
    /// waiting-for-input flag; any later non-prompt line clears it.
    pub fn record_output(&mut self, line: &str, now_ms: u64) {
        self.output_events.push_back(now_ms);
        self.last_output_at_ms = Some(now_ms);

        let lowered = line.to_ascii_lowercase();
        self.waiting_for_input = self
            .config
            .input_prompt_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()));

        if StderrClassifier::is_progress_indicator(line)
            || self
                .config
                .progress_marker_patterns
                .iter()
                .any(|pattern| lowered.contains(&pattern.to_ascii_lowercase()))
        {
            self.progress_markers.push_back(now_ms);
        }
        self.prune(now_ms);
    }

    pub fn record_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn record_resources(&mut self, cpu_percent: f64, memory_mb: f64) {
        self.cpu_percent = cpu_percent;
        self.memory_mb = memory_mb;
    }

    pub fn snapshot(&mut self, now_ms: u64) -> HeartbeatSnapshot {
        self.prune(now_ms);
        let window_s = self.config.analysis_window_ms as f64 / 1_000.0;
        let output_rate = if window_s > 0.0 {
            self.output_events.len() as f64 / window_s
        } else {
            0.0
        };
        HeartbeatSnapshot {
            cpu_percent: self.cpu_percent,
            memory_mb: self.memory_mb,
            output_rate,
            last_output_at_ms: self.last_output_at_ms,
            error_count: self.error_count,
            process_runtime_ms: now_ms.saturating_sub(self.started_at_ms),
            progress_marker_count: self.progress_markers.len() as u32,
            is_waiting_for_input: self.waiting_for_input,
            taken_at_ms: now_ms,
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.config.analysis_window_ms);
        while self.output_events.front().is_some_and(|at| *at < cutoff) {
            self.output_events.pop_front();
        }
        while self.progress_markers.front().is_some_and(|at| *at < cutoff) {
            self.progress_markers.pop_front();
        }
    }
}

/// Liveness verdict for one snapshot. Rules run in order and short-circuit
/// toward the least drastic outcome that fits the evidence; `confidence`
/// grows with the number of independent signals that agree, never from one
/// metric alone.
pub fn analyze(snapshot: &HeartbeatSnapshot, config: &HeartbeatConfig) -> HealthVerdict {
    // A process blocked on a prompt is healthy no matter what the other
    // metrics say.
    if snapshot.is_waiting_for_input {
        return HealthVerdict {
            is_healthy: true,
            should_terminate: false,
            confidence: 1.0,
            warnings: Vec::new(),
        };
    }

    let silence_ms = match snapshot.last_output_at_ms {
        Some(at) => snapshot.taken_at_ms.saturating_sub(at),
        None => snapshot.process_runtime_ms,
    };
    let silent_too_long = silence_ms > config.max_silence_ms;
    let markers_below = snapshot.progress_marker_count < config.min_progress_markers;
    let rate_below = snapshot.output_rate < config.min_output_rate;
    let errors_over = snapshot.error_count > config.max_error_count;
    let cpu_over = snapshot.cpu_percent > config.cpu_threshold;
    let memory_over = snapshot.memory_mb > config.memory_threshold_mb;

    if errors_over {
        let corroborating = 1
            + usize::from(silent_too_long)
            + usize::from(rate_below)
            + usize::from(markers_below);
        return HealthVerdict {
            is_healthy: false,
            should_terminate: false,
            confidence: corroboration(corroborating),
            warnings: vec![format!(
                "Error volume too high: {} classified errors (max {})",
                snapshot.error_count, config.max_error_count
            )],
        };
    }

    let mut warnings = Vec::new();
    if cpu_over {
        warnings.push(format!(
            "CPU usage {:.1}% exceeds threshold {:.1}%",
            snapshot.cpu_percent, config.cpu_threshold
        ));
    }
    if memory_over {
        warnings.push(format!(
            "Memory usage {:.1} MB exceeds threshold {:.1} MB",
            snapshot.memory_mb, config.memory_threshold_mb
        ));
    }

    // Termination needs all three stall signals at once.
    if silent_too_long && markers_below && rate_below {
        let corroborating = 3 + usize::from(cpu_over) + usize::from(memory_over);
        warnings.push(format!(
            "No output for {}ms with {} progress markers and output rate {:.3}/s",
            silence_ms, snapshot.progress_marker_count, snapshot.output_rate
        ));
        return HealthVerdict {
            is_healthy: false,
            should_terminate: true,
            confidence: corroboration(corroborating),
            warnings,
        };
    }

    let healthy_signals = usize::from(!silent_too_long)
        + usize::from(!markers_below)
        + usize::from(!rate_below)
        + usize::from(!errors_over);
    HealthVerdict {
        is_healthy: true,
        should_terminate: false,
        confidence: corroboration(healthy_signals),
        warnings,
    }
}

fn corroboration(agreeing_signals: usize) -> f64 {
    (0.4 + 0.15 * agreeing_signals as f64).min(0.95)
}

#[cfg(test)]
#[path = "../tests/unit/heartbeat_tests.rs"]
mod tests;
