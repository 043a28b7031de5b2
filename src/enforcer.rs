use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::sampler::{ResourceProbe, ResourceSample};
use crate::timer::{Scheduler, TimerHandle};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    pub cpu_warn_percent: f64,
    pub cpu_kill_percent: f64,
    pub memory_warn_percent: f64,
    pub memory_kill_percent: f64,
    pub check_interval_ms: u64,
    /// Consecutive over-kill-threshold samples required before terminating.
    pub violation_threshold: u32,
    pub execution_timeout_ms: u64,
    /// Wall-clock checkpoint before the hard timeout; warning only.
    pub warning_timeout_ms: u64,
    /// Wait between the graceful and the forceful signal.
    pub grace_period_ms: u64,
}

impl Default for ResourceLimitConfig {
    fn default() -> Self {
        Self {
            cpu_warn_percent: 80.0,
            cpu_kill_percent: 95.0,
            memory_warn_percent: 70.0,
            memory_kill_percent: 90.0,
            check_interval_ms: 5_000,
            violation_threshold: 3,
            execution_timeout_ms: 600_000,
            warning_timeout_ms: 480_000,
            grace_period_ms: 5_000,
        }
    }
}

/// Signal surface of one supervised child. The real implementation wraps a
/// PID with unix signals; tests use deterministic fakes.
pub trait SupervisedProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn is_running(&self) -> bool;
    fn signal_graceful(&self);
    fn signal_forceful(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    Cpu,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub dimension: ResourceDimension,
    pub measured: f64,
    pub limit: f64,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    CpuLimitExceeded,
    MemoryLimitExceeded,
    ExecutionTimeout,
    MissingPid,
    Stalled,
    Cancelled,
}

impl TerminationReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::CpuLimitExceeded => "CPU limit exceeded",
            Self::MemoryLimitExceeded => "memory limit exceeded",
            Self::ExecutionTimeout => "execution timeout exceeded",
            Self::MissingPid => "process has no PID",
            Self::Stalled => "process stalled with no output or progress",
            Self::Cancelled => "task cancelled",
        }
    }
}

/// Outcome of one supervised run. `success` is false whenever the
/// termination was enforcer-initiated, regardless of the exit code the
/// process eventually reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub termination_reason: Option<TerminationReason>,
    pub final_resource_usage: Option<ResourceSample>,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
}

struct EnforcementShared {
    label: String,
    grace_period_ms: u64,
    process: Arc<dyn SupervisedProcess>,
    consecutive_cpu: u32,
    consecutive_memory: u32,
    cpu_warn_active: bool,
    memory_warn_active: bool,
    violations: Vec<Violation>,
    warnings: Vec<String>,
    last_sample: Option<ResourceSample>,
    outcome: Option<TerminationResult>,
    timers: Vec<TimerHandle>,
}

impl EnforcementShared {
    fn result_from_state(
        &self,
        success: bool,
        exit_code: Option<i32>,
        reason: Option<TerminationReason>,
    ) -> TerminationResult {
        TerminationResult {
            success,
            exit_code,
            termination_reason: reason,
            final_resource_usage: self.last_sample.clone(),
            violations: self.violations.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Live enforcement of one wrapped process. Owned by the orchestrator for
/// the life of the subprocess; clones share the same state.
#[derive(Clone)]
pub struct Enforcement {
    shared: Arc<Mutex<EnforcementShared>>,
    scheduler: Arc<dyn Scheduler>,
}

impl Enforcement {
    pub fn is_finished(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn result(&self) -> Option<TerminationResult> {
        self.lock().outcome.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.lock().warnings.clone()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.lock().violations.clone()
    }

    pub fn last_sample(&self) -> Option<ResourceSample> {
        self.lock().last_sample.clone()
    }

    /// Record a natural process exit. If the enforcer already terminated the
    /// process, its result wins and only the missing exit code is filled in.
    /// Either way every remaining timer is cancelled, grace escalation
    /// included; once the exit is reaped the PID may belong to someone else.
    pub fn complete(&self, exited_ok: bool, exit_code: Option<i32>) -> TerminationResult {
        let mut guard = self.lock();
        cancel_timers(&mut guard, &self.scheduler);
        if let Some(outcome) = guard.outcome.as_mut() {
            if outcome.exit_code.is_none() {
                outcome.exit_code = exit_code;
            }
            return outcome.clone();
        }
        let result = guard.result_from_state(exited_ok, exit_code, None);
        guard.outcome = Some(result.clone());
        result
    }

    /// Stop all enforcement timers without deciding an outcome. Accumulated
    /// violations and warnings stay available for diagnostics.
    pub fn cancel(&self) {
        let mut guard = self.lock();
        cancel_timers(&mut guard, &self.scheduler);
    }

    /// Terminate on behalf of an outside supervisor, with the same
    /// graceful-then-forceful sequence the enforcer uses itself.
    pub fn terminate(&self, reason: TerminationReason) {
        let mut guard = self.lock();
        terminate(&mut guard, &self.scheduler, reason);
    }

    fn lock(&self) -> MutexGuard<'_, EnforcementShared> {
        self.shared.lock().expect("enforcement state poisoned")
    }
}

/// Two-tier resource limit enforcer. Samples the wrapped process on a timer,
/// warns at the warn thresholds, and terminates after `violation_threshold`
/// consecutive samples over a kill threshold or at the execution timeout.
pub struct LimitEnforcer {
    scheduler: Arc<dyn Scheduler>,
    probe: Arc<dyn ResourceProbe>,
    config: ResourceLimitConfig,
}

impl LimitEnforcer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        probe: Arc<dyn ResourceProbe>,
        config: ResourceLimitConfig,
    ) -> Self {
        Self {
            scheduler,
            probe,
            config,
        }
    }

    pub fn wrap_process(&self, process: Arc<dyn SupervisedProcess>, label: &str) -> Enforcement {
        let shared = Arc::new(Mutex::new(EnforcementShared {
            label: label.to_string(),
            grace_period_ms: self.config.grace_period_ms,
            process: process.clone(),
            consecutive_cpu: 0,
            consecutive_memory: 0,
            cpu_warn_active: false,
            memory_warn_active: false,
            violations: Vec::new(),
            warnings: Vec::new(),
            last_sample: None,
            outcome: None,
            timers: Vec::new(),
        }));
        let enforcement = Enforcement {
            shared: shared.clone(),
            scheduler: self.scheduler.clone(),
        };

        if process.pid().is_none() {
            let mut guard = shared.lock().expect("enforcement state poisoned");
            let result = guard.result_from_state(
                false,
                None,
                Some(TerminationReason::MissingPid),
            );
            guard.outcome = Some(result);
            tracing::warn!(label, "refusing to supervise a process without a PID");
            return enforcement;
        }

        let config = self.config.clone();

        let check = {
            let shared = shared.clone();
            let probe = self.probe.clone();
            let scheduler = self.scheduler.clone();
            let config = config.clone();
            move || check_tick(&shared, &probe, &scheduler, &config)
        };
        self.arm(&shared, Interval(config.check_interval_ms), Box::new(check));

        if config.warning_timeout_ms < config.execution_timeout_ms {
            let warn = {
                let shared = shared.clone();
                let warning_ms = config.warning_timeout_ms;
                let timeout_ms = config.execution_timeout_ms;
                move || {
                    let mut guard = shared.lock().expect("enforcement state poisoned");
                    if guard.outcome.is_some() {
                        return;
                    }
                    tracing::warn!(label = %guard.label, "approaching execution timeout");
                    guard.warnings.push(format!(
                        "Approaching execution timeout: {warning_ms}ms of {timeout_ms}ms elapsed"
                    ));
                }
            };
            self.arm(&shared, OneShot(config.warning_timeout_ms), Box::new(warn));
        }

        let timeout = {
            let shared = shared.clone();
            let scheduler = self.scheduler.clone();
            move || {
                let mut guard = shared.lock().expect("enforcement state poisoned");
                terminate(&mut guard, &scheduler, TerminationReason::ExecutionTimeout);
            }
        };
        self.arm(&shared, OneShot(config.execution_timeout_ms), Box::new(timeout));

        enforcement
    }

    fn arm(
        &self,
        shared: &Arc<Mutex<EnforcementShared>>,
        kind: TimerKind,
        callback: crate::timer::TimerCallback,
    ) {
        let scheduled = match kind {
            Interval(ms) => self.scheduler.schedule_interval(callback, ms),
            OneShot(ms) => self.scheduler.schedule(callback, ms),
        };
        let mut guard = shared.lock().expect("enforcement state poisoned");
        match scheduled {
            Ok(handle) => guard.timers.push(handle),
            // Bad timer config degrades to unmonitored, never to a crash.
            Err(err) => {
                tracing::warn!(label = %guard.label, %err, "failed to arm enforcement timer");
                guard.warnings.push(format!("Enforcement timer not armed: {err}"));
            }
        }
    }
}

enum TimerKind {
    Interval(u64),
    OneShot(u64),
}
use TimerKind::{Interval, OneShot};

fn check_tick(
    shared: &Arc<Mutex<EnforcementShared>>,
    probe: &Arc<dyn ResourceProbe>,
    scheduler: &Arc<dyn Scheduler>,
    config: &ResourceLimitConfig,
) {
    let mut guard = shared.lock().expect("enforcement state poisoned");
    if guard.outcome.is_some() {
        return;
    }
    let Some(pid) = guard.process.pid() else {
        return;
    };
    let Some(sample) = probe.sample(pid) else {
        // Process gone between ticks. The exit path records the outcome;
        // just stop burning timers.
        if !guard.process.is_running() {
            cancel_timers(&mut guard, scheduler);
        }
        return;
    };
    let now = scheduler.now_ms();

    if sample.cpu_percent >= config.cpu_kill_percent {
        guard.consecutive_cpu += 1;
        guard.violations.push(Violation {
            dimension: ResourceDimension::Cpu,
            measured: sample.cpu_percent,
            limit: config.cpu_kill_percent,
            at_ms: now,
        });
    } else {
        guard.consecutive_cpu = 0;
        // One warning per sustained breach; the latch clears once usage
        // drops back under the warn tier.
        if sample.cpu_percent >= config.cpu_warn_percent {
            if !guard.cpu_warn_active {
                guard.cpu_warn_active = true;
                guard.warnings.push(format!(
                    "CPU usage {:.1}% over warning threshold {:.1}%",
                    sample.cpu_percent, config.cpu_warn_percent
                ));
            }
        } else {
            guard.cpu_warn_active = false;
        }
    }

    if sample.memory_percent >= config.memory_kill_percent {
        guard.consecutive_memory += 1;
        guard.violations.push(Violation {
            dimension: ResourceDimension::Memory,
            measured: sample.memory_percent,
            limit: config.memory_kill_percent,
            at_ms: now,
        });
    } else {
        guard.consecutive_memory = 0;
        if sample.memory_percent >= config.memory_warn_percent {
            if !guard.memory_warn_active {
                guard.memory_warn_active = true;
                guard.warnings.push(format!(
                    "Memory usage {:.1}% over warning threshold {:.1}%",
                    sample.memory_percent, config.memory_warn_percent
                ));
            }
        } else {
            guard.memory_warn_active = false;
        }
    }

    guard.last_sample = Some(sample);

    if guard.consecutive_cpu >= config.violation_threshold {
        terminate(&mut guard, scheduler, TerminationReason::CpuLimitExceeded);
    } else if guard.consecutive_memory >= config.violation_threshold {
        terminate(&mut guard, scheduler, TerminationReason::MemoryLimitExceeded);
    }
}

fn terminate(
    guard: &mut MutexGuard<'_, EnforcementShared>,
    scheduler: &Arc<dyn Scheduler>,
    reason: TerminationReason,
) {
    if guard.outcome.is_some() {
        return;
    }
    cancel_timers(guard, scheduler);
    tracing::warn!(label = %guard.label, reason = reason.describe(), "terminating supervised process");

    guard.process.signal_graceful();
    let process = guard.process.clone();
    let escalate = move || {
        if process.is_running() {
            process.signal_forceful();
        }
    };
    match scheduler.schedule(Box::new(escalate), guard.grace_period_ms) {
        // Keep the handle so a natural exit during grace cancels the
        // escalation instead of signalling a possibly reused PID.
        Ok(handle) => guard.timers.push(handle),
        Err(err) => {
            // No grace timer available; escalate immediately rather than
            // leak the child.
            tracing::warn!(%err, "grace timer unavailable, escalating immediately");
            if guard.process.is_running() {
                guard.process.signal_forceful();
            }
        }
    }

    let result = guard.result_from_state(false, None, Some(reason));
    guard.outcome = Some(result);
}

fn cancel_timers(guard: &mut MutexGuard<'_, EnforcementShared>, scheduler: &Arc<dyn Scheduler>) {
    for handle in guard.timers.drain(..) {
        scheduler.cancel(handle);
    }
}

/// Signal delivery by PID. `ESRCH` means the process already exited, which
/// is exactly the no-op the termination sequence wants.
#[cfg(unix)]
pub struct UnixProcess {
    pid: u32,
}

#[cfg(unix)]
impl UnixProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    fn send(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                tracing::debug!(pid = self.pid, %signal, %err, "signal delivery failed");
            }
        }
    }
}

#[cfg(unix)]
impl SupervisedProcess for UnixProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_running(&self) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    fn signal_graceful(&self) {
        self.send(nix::sys::signal::Signal::SIGTERM);
    }

    fn signal_forceful(&self) {
        self.send(nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(test)]
#[path = "../tests/unit/enforcer_tests.rs"]
mod tests;
