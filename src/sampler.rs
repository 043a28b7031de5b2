use std::collections::{HashMap, VecDeque};
use std::process::Command;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::timer::{Scheduler, TimerError, TimerHandle};

/// Point-in-time snapshot of one OS process, as reported by `ps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub pid: u32,
    pub parent_pid: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub rss_kb: u64,
    pub vsz_kb: u64,
    pub state: ProcessState,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskWait,
    Stopped,
    Zombie,
    Idle,
    Unknown,
}

impl ProcessState {
    fn from_ps_code(code: &str) -> Self {
        match code.chars().next() {
            Some('R') => Self::Running,
            Some('S') => Self::Sleeping,
            Some('D') | Some('U') => Self::DiskWait,
            Some('T') => Self::Stopped,
            Some('Z') => Self::Zombie,
            Some('I') => Self::Idle,
            _ => Self::Unknown,
        }
    }

    pub fn is_zombie(self) -> bool {
        self == Self::Zombie
    }
}

/// OS lookup seam. Monitoring code never talks to `ps` directly so tests can
/// substitute scripted probes.
pub trait ResourceProbe: Send + Sync {
    /// `None` means the PID is gone or not accessible; that is an answer,
    /// not an error.
    fn sample(&self, pid: u32) -> Option<ResourceSample>;

    /// System-wide zombie scan. An empty list when scanning itself fails.
    fn scan_zombies(&self) -> Vec<ResourceSample>;
}

const DETAILED_COLUMNS: &str = "pid=,ppid=,%cpu=,%mem=,rss=,vsz=,state=,comm=";

/// Probe that shells out to the system `ps`. Tries a detailed row first and
/// falls back to a minimal CPU/memory row when the detailed form cannot be
/// parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsProbe;

impl PsProbe {
    fn run_ps(args: &[&str]) -> Option<String> {
        let output = Command::new("ps").args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8(output.stdout).ok()
    }
}

impl ResourceProbe for PsProbe {
    fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let pid_arg = pid.to_string();
        if let Some(stdout) = Self::run_ps(&["-o", DETAILED_COLUMNS, "-p", &pid_arg])
            && let Some(sample) = stdout.lines().find_map(parse_detailed_row)
        {
            return Some(sample);
        }
        let stdout = Self::run_ps(&["-o", "%cpu=,%mem=", "-p", &pid_arg])?;
        stdout.lines().find_map(|line| parse_minimal_row(pid, line))
    }

    fn scan_zombies(&self) -> Vec<ResourceSample> {
        let Some(stdout) = Self::run_ps(&["-eo", DETAILED_COLUMNS]) else {
            return Vec::new();
        };
        stdout
            .lines()
            .filter_map(parse_detailed_row)
            .filter(|sample| sample.state.is_zombie())
            .collect()
    }
}

fn parse_detailed_row(line: &str) -> Option<ResourceSample> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let parent_pid = fields.next()?.parse().ok()?;
    let cpu_percent = fields.next()?.parse().ok()?;
    let memory_percent = fields.next()?.parse().ok()?;
    let rss_kb = fields.next()?.parse().ok()?;
    let vsz_kb = fields.next()?.parse().ok()?;
    let state = ProcessState::from_ps_code(fields.next()?);
    let command = fields.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    Some(ResourceSample {
        pid,
        parent_pid,
        cpu_percent,
        memory_percent,
        rss_kb,
        vsz_kb,
        state,
        command,
    })
}

fn parse_minimal_row(pid: u32, line: &str) -> Option<ResourceSample> {
    let mut fields = line.split_whitespace();
    let cpu_percent = fields.next()?.parse().ok()?;
    let memory_percent = fields.next()?.parse().ok()?;
    Some(ResourceSample {
        pid,
        parent_pid: 0,
        cpu_percent,
        memory_percent,
        rss_kb: 0,
        vsz_kb: 0,
        state: ProcessState::Unknown,
        command: String::new(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub check_interval_ms: u64,
    pub max_history: usize,
    pub zombie_scan_enabled: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            max_history: 60,
            zombie_scan_enabled: true,
        }
    }
}

struct Watch {
    timer: TimerHandle,
}

/// Continuous per-PID sampling on the shared scheduler. Each watched PID
/// keeps a bounded ring of recent samples; history survives `stop_monitoring`
/// so a cancelled task can still be inspected.
pub struct ResourceMonitor {
    scheduler: Arc<dyn Scheduler>,
    probe: Arc<dyn ResourceProbe>,
    config: SamplerConfig,
    watches: Mutex<HashMap<u32, Watch>>,
    histories: Arc<Mutex<HashMap<u32, VecDeque<ResourceSample>>>>,
}

impl ResourceMonitor {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        probe: Arc<dyn ResourceProbe>,
        config: SamplerConfig,
    ) -> Self {
        Self {
            scheduler,
            probe,
            config,
            watches: Mutex::new(HashMap::new()),
            histories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin recurring sampling of `pid`. A second call for an already
    /// monitored PID is a no-op.
    pub fn start_monitoring(&self, pid: u32) -> Result<(), TimerError> {
        let mut watches = self.watches.lock().expect("watch map poisoned");
        if watches.contains_key(&pid) {
            return Ok(());
        }
        self.histories
            .lock()
            .expect("history map poisoned")
            .entry(pid)
            .or_default();

        let probe = self.probe.clone();
        let histories = self.histories.clone();
        let max_history = self.config.max_history.max(1);
        let timer = self.scheduler.schedule_interval(
            Box::new(move || {
                let Some(sample) = probe.sample(pid) else {
                    tracing::debug!(pid, "resource sample unavailable, keeping last history");
                    return;
                };
                let mut histories = histories.lock().expect("history map poisoned");
                let Some(history) = histories.get_mut(&pid) else {
                    return;
                };
                if history.len() >= max_history {
                    history.pop_front();
                }
                history.push_back(sample);
            }),
            self.config.check_interval_ms,
        )?;
        watches.insert(pid, Watch { timer });
        Ok(())
    }

    /// Stop sampling `pid`. Idempotent; retained history stays available.
    pub fn stop_monitoring(&self, pid: u32) {
        let mut watches = self.watches.lock().expect("watch map poisoned");
        if let Some(watch) = watches.remove(&pid) {
            self.scheduler.cancel(watch.timer);
        }
    }

    pub fn stop_all(&self) {
        let mut watches = self.watches.lock().expect("watch map poisoned");
        for (_, watch) in watches.drain() {
            self.scheduler.cancel(watch.timer);
        }
    }

    pub fn is_monitoring(&self, pid: u32) -> bool {
        self.watches
            .lock()
            .expect("watch map poisoned")
            .contains_key(&pid)
    }

    pub fn history(&self, pid: u32) -> Vec<ResourceSample> {
        self.histories
            .lock()
            .expect("history map poisoned")
            .get(&pid)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, pid: u32) -> Option<ResourceSample> {
        self.histories
            .lock()
            .expect("history map poisoned")
            .get(&pid)
            .and_then(|history| history.back().cloned())
    }

    pub fn detect_zombie_processes(&self) -> Vec<ResourceSample> {
        if !self.config.zombie_scan_enabled {
            return Vec::new();
        }
        self.probe.scan_zombies()
    }
}

#[cfg(test)]
#[path = "../tests/unit/sampler_tests.rs"]
mod tests;
