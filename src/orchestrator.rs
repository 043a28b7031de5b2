use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::agent::{AgentCommandConfig, AgentEvent, AgentHandle};
use crate::classifier::{ClassifiedError, ErrorKind, StderrClassifier};
use crate::config::{RetryConfig, TaskSpec, WardenConfig};
use crate::enforcer::{
    Enforcement, LimitEnforcer, SupervisedProcess, TerminationReason, TerminationResult, Violation,
};
use crate::events::{EventBus, SupervisorEvent};
use crate::heartbeat::{self, HeartbeatTracker};
use crate::sampler::{ResourceMonitor, ResourceProbe, ResourceSample};
use crate::timer::{Scheduler, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Succeeded,
    Retrying,
    CheckpointedFailed,
    Terminated,
}

/// Failure taxonomy driving the retry decision. Auth, rate-limit, and model
/// failures are never transient; retrying them only burns quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    RateLimit,
    Model,
    Network,
    Generic,
    Timeout,
    Stalled,
    ResourceViolation,
    Spawn,
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Auth | Self::RateLimit | Self::Model | Self::Spawn | Self::Cancelled
        )
    }

    fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Auth => Self::Auth,
            ErrorKind::RateLimit => Self::RateLimit,
            ErrorKind::Model => Self::Model,
            ErrorKind::Network => Self::Network,
            ErrorKind::Generic => Self::Generic,
        }
    }

    fn from_termination(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::ExecutionTimeout => Self::Timeout,
            TerminationReason::Stalled => Self::Stalled,
            TerminationReason::CpuLimitExceeded | TerminationReason::MemoryLimitExceeded => {
                Self::ResourceViolation
            }
            TerminationReason::MissingPid => Self::Spawn,
            TerminationReason::Cancelled => Self::Cancelled,
        }
    }
}

/// Retry budget policy. The exact growth curve is tunable; implementations
/// only have to keep the result within a sane multiple of the base budget.
pub trait TimeoutPolicy: Send + Sync {
    fn next_timeout_ms(
        &self,
        base_timeout_ms: u64,
        complexity: f64,
        prior_elapsed_ms: u64,
        failure: FailureKind,
    ) -> u64;
}

/// Scales the base budget by the task's complexity hint, gives a timed-out
/// attempt half again its prior elapsed time, and never exceeds four times
/// the base budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTimeoutPolicy;

impl TimeoutPolicy for DefaultTimeoutPolicy {
    fn next_timeout_ms(
        &self,
        base_timeout_ms: u64,
        complexity: f64,
        prior_elapsed_ms: u64,
        failure: FailureKind,
    ) -> u64 {
        let ceiling = base_timeout_ms.saturating_mul(4);
        let scaled = (base_timeout_ms as f64 * complexity.max(1.0)) as u64;
        let bumped = match failure {
            FailureKind::Timeout | FailureKind::Stalled => {
                scaled.max(prior_elapsed_ms.saturating_mul(3) / 2)
            }
            _ => scaled,
        };
        bumped.clamp(base_timeout_ms, ceiling)
    }
}

/// Mutable state that survives across retries of one logical task and is
/// discarded when the task reaches a terminal state.
#[derive(Debug, Clone)]
pub struct OrchestratorRetryState {
    pub attempt: u32,
    pub last_failure: Option<FailureKind>,
    pub adaptive_timeout_ms: u64,
    pub checkpoint: Option<String>,
    failure_counts: HashMap<FailureKind, u32>,
}

impl OrchestratorRetryState {
    pub fn new(base_timeout_ms: u64) -> Self {
        Self {
            attempt: 0,
            last_failure: None,
            adaptive_timeout_ms: base_timeout_ms,
            checkpoint: None,
            failure_counts: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        *self.failure_counts.entry(kind).or_insert(0) += 1;
        self.last_failure = Some(kind);
    }

    pub fn failure_count(&self, kind: FailureKind) -> u32 {
        self.failure_counts.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    NotRetryable,
    MaxAttemptsReached,
    RepeatingFailurePattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_timeout_ms: u64 },
    Abort { reason: AbortReason },
}

/// Retry decision for one recorded failure. Call after
/// [`OrchestratorRetryState::record_failure`]; the repeat counters double as
/// a lightweight circuit breaker.
pub fn decide_after_failure(
    kind: FailureKind,
    state: &OrchestratorRetryState,
    retry: &RetryConfig,
    policy: &dyn TimeoutPolicy,
    base_timeout_ms: u64,
    complexity: f64,
    prior_elapsed_ms: u64,
) -> RetryDecision {
    if !kind.is_retryable() {
        return RetryDecision::Abort {
            reason: AbortReason::NotRetryable,
        };
    }
    if state.failure_count(kind) >= retry.pattern_threshold {
        return RetryDecision::Abort {
            reason: AbortReason::RepeatingFailurePattern,
        };
    }
    if state.attempt >= retry.max_attempts {
        return RetryDecision::Abort {
            reason: AbortReason::MaxAttemptsReached,
        };
    }
    RetryDecision::Retry {
        next_timeout_ms: policy.next_timeout_ms(base_timeout_ms, complexity, prior_elapsed_ms, kind),
    }
}

/// Terminal outcome of one logical task, retries included.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub termination_reason: Option<TerminationReason>,
    pub failure_kind: Option<FailureKind>,
    pub abort_reason: Option<AbortReason>,
    pub attempts: u32,
    pub classified_errors: Vec<ClassifiedError>,
    pub final_resource_usage: Option<ResourceSample>,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
    pub checkpoint: Option<String>,
    pub final_state: TaskState,
    pub state_history: Vec<TaskState>,
}

struct AttemptReport {
    failure: Option<FailureKind>,
    result: TerminationResult,
    errors: Vec<ClassifiedError>,
    elapsed_ms: u64,
}

/// Supervises one subprocess per attempt: spawns it, wires the heartbeat
/// tracker, limit enforcer, and classifier onto its streams, and turns the
/// combined signals into a terminal [`TaskResult`].
pub struct Orchestrator {
    scheduler: Arc<dyn Scheduler>,
    probe: Arc<dyn ResourceProbe>,
    bus: Arc<EventBus>,
    policy: Box<dyn TimeoutPolicy>,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        probe: Arc<dyn ResourceProbe>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            scheduler,
            probe,
            bus,
            policy: Box::new(DefaultTimeoutPolicy),
        }
    }

    pub fn with_timeout_policy(mut self, policy: Box<dyn TimeoutPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn run_task(&self, spec: &TaskSpec, base_config: &WardenConfig) -> TaskResult {
        self.run_task_cancellable(spec, base_config, &AtomicBool::new(false))
    }

    /// Run one task to a terminal state. Setting `cancel` from another
    /// thread stops the current attempt's timers and monitoring in one
    /// operation; diagnostics collected so far are kept.
    pub fn run_task_cancellable(
        &self,
        spec: &TaskSpec,
        base_config: &WardenConfig,
        cancel: &AtomicBool,
    ) -> TaskResult {
        let config = base_config.with_overrides(&spec.overrides);
        let mut retry = OrchestratorRetryState::new(config.limits.execution_timeout_ms);
        let mut states = vec![TaskState::Idle];
        let mut all_errors: Vec<ClassifiedError> = Vec::new();

        loop {
            retry.attempt += 1;
            states.push(TaskState::Running);
            tracing::info!(task = %spec.name, attempt = retry.attempt, "starting attempt");

            let report = self.run_attempt(spec, &config, &mut retry, cancel);
            all_errors.extend(report.errors.iter().cloned());

            let Some(kind) = report.failure else {
                states.push(TaskState::Succeeded);
                return finish(
                    spec, &retry, report, all_errors, states, TaskState::Succeeded, None,
                );
            };

            retry.record_failure(kind);
            let decision = decide_after_failure(
                kind,
                &retry,
                &config.retry,
                self.policy.as_ref(),
                config.limits.execution_timeout_ms,
                spec.complexity,
                report.elapsed_ms,
            );
            match decision {
                RetryDecision::Retry { next_timeout_ms } => {
                    tracing::info!(
                        task = %spec.name,
                        ?kind,
                        next_timeout_ms,
                        "retrying after transient failure"
                    );
                    states.push(TaskState::Retrying);
                    retry.adaptive_timeout_ms = next_timeout_ms;
                }
                RetryDecision::Abort { reason } => {
                    let final_state = if retry.checkpoint.is_some() {
                        TaskState::CheckpointedFailed
                    } else {
                        TaskState::Terminated
                    };
                    states.push(final_state);
                    tracing::warn!(task = %spec.name, ?kind, ?reason, "task failed");
                    return finish(
                        spec,
                        &retry,
                        report,
                        all_errors,
                        states,
                        final_state,
                        Some(reason),
                    );
                }
            }
        }
    }

    fn run_attempt(
        &self,
        spec: &TaskSpec,
        config: &WardenConfig,
        retry: &mut OrchestratorRetryState,
        cancel: &AtomicBool,
    ) -> AttemptReport {
        let started_ms = self.scheduler.now_ms();
        let agent_config = AgentCommandConfig {
            program: spec.program.clone(),
            args: spec.args.clone(),
            model: spec.model.clone(),
        };
        let handle = AgentHandle::spawn(&agent_config, retry.checkpoint.as_deref());
        let mut classifier = StderrClassifier::new();

        let Some(pid) = handle.pid() else {
            let mut warnings = Vec::new();
            for event in handle.drain_events_limited(usize::MAX) {
                if let AgentEvent::System(note) = event {
                    warnings.push(note);
                }
            }
            return AttemptReport {
                failure: Some(FailureKind::Spawn),
                result: TerminationResult {
                    success: false,
                    exit_code: None,
                    termination_reason: Some(TerminationReason::MissingPid),
                    final_resource_usage: None,
                    violations: Vec::new(),
                    warnings,
                },
                errors: Vec::new(),
                elapsed_ms: self.scheduler.now_ms().saturating_sub(started_ms),
            };
        };

        let mut limits = config.limits.clone();
        limits.execution_timeout_ms = retry.adaptive_timeout_ms;
        if limits.execution_timeout_ms != config.limits.execution_timeout_ms {
            // Keep the warning checkpoint proportional once the budget adapts.
            limits.warning_timeout_ms = limits.execution_timeout_ms / 10 * 8;
        }

        #[cfg(unix)]
        let process: Arc<dyn SupervisedProcess> = Arc::new(crate::enforcer::UnixProcess::new(pid));
        #[cfg(not(unix))]
        let process: Arc<dyn SupervisedProcess> = unimplemented!("unix-only supervision");

        let enforcer = LimitEnforcer::new(self.scheduler.clone(), self.probe.clone(), limits.clone());
        let enforcement = enforcer.wrap_process(process, &spec.name);

        let monitor = Arc::new(ResourceMonitor::new(
            self.scheduler.clone(),
            self.probe.clone(),
            config.sampler.clone(),
        ));
        if let Err(err) = monitor.start_monitoring(pid) {
            tracing::warn!(task = %spec.name, %err, "resource monitoring unavailable");
        }

        let tracker = Arc::new(Mutex::new(HeartbeatTracker::new(
            config.heartbeat.clone(),
            started_ms,
        )));
        let mut attempt_timers: Vec<TimerHandle> = Vec::new();
        self.arm_heartbeat(
            spec,
            config,
            pid,
            &tracker,
            &enforcement,
            &monitor,
            &mut attempt_timers,
        );
        self.arm_timeout_warnings(spec, limits.execution_timeout_ms, &enforcement, &mut attempt_timers);

        let marker = config.retry.checkpoint_marker.as_str();
        let mut exit: Option<(bool, Option<i32>)> = None;
        let mut errors: Vec<ClassifiedError> = Vec::new();
        let mut cancelled = false;

        while exit.is_none() {
            if cancel.load(Ordering::SeqCst) && !cancelled {
                cancelled = true;
                enforcement.terminate(TerminationReason::Cancelled);
            }
            let Some(event) = handle.recv_event_timeout(Duration::from_millis(25)) else {
                continue;
            };
            let now = self.scheduler.now_ms();
            match event {
                AgentEvent::Stdout(line) => {
                    if let Some(payload) = line.strip_prefix(marker) {
                        retry.checkpoint = Some(payload.trim().to_string());
                    }
                    lock_tracker(&tracker).record_output(&line, now);
                }
                AgentEvent::Stderr(line) => {
                    lock_tracker(&tracker).record_output(&line, now);
                    if let Some(error) = classifier.parse_chunk(&format!("{line}\n")) {
                        lock_tracker(&tracker).record_error();
                        self.bus.emit(SupervisorEvent::ErrorDetected {
                            task: spec.name.clone(),
                            error: error.clone(),
                        });
                        errors.push(error);
                    }
                }
                AgentEvent::System(note) => {
                    tracing::debug!(task = %spec.name, note, "subprocess notice");
                }
                AgentEvent::Exited { success, code } => exit = Some((success, code)),
            }
        }

        if let Some(error) = classifier.parse_remaining() {
            errors.push(error);
        }

        for handle in attempt_timers {
            self.scheduler.cancel(handle);
        }
        monitor.stop_monitoring(pid);

        let (exited_ok, exit_code) = exit.unwrap_or((false, None));
        let mut result = enforcement.complete(exited_ok, exit_code);
        if result.final_resource_usage.is_none() {
            result.final_resource_usage = monitor.latest(pid);
        }

        let elapsed_ms = self.scheduler.now_ms().saturating_sub(started_ms);
        let first_fatal = classifier
            .first_fatal_error()
            .map(|fatal| FailureKind::from_error_kind(fatal.kind));
        let failure = if cancelled {
            Some(FailureKind::Cancelled)
        } else if let Some(reason) = result.termination_reason {
            Some(FailureKind::from_termination(reason))
        } else if !result.success {
            first_fatal.or(Some(FailureKind::Generic))
        } else {
            // A clean exit still fails on a non-transient fatal error; the
            // CLI sometimes reports those without a failing status.
            first_fatal.filter(|kind| !kind.is_retryable())
        };
        if failure.is_some() {
            result.success = false;
        }

        AttemptReport {
            failure,
            result,
            errors,
            elapsed_ms,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn arm_heartbeat(
        &self,
        spec: &TaskSpec,
        config: &WardenConfig,
        pid: u32,
        tracker: &Arc<Mutex<HeartbeatTracker>>,
        enforcement: &Enforcement,
        monitor: &Arc<ResourceMonitor>,
        attempt_timers: &mut Vec<TimerHandle>,
    ) {
        let tick = {
            let tracker = tracker.clone();
            let enforcement = enforcement.clone();
            let monitor = monitor.clone();
            let bus = self.bus.clone();
            let scheduler = self.scheduler.clone();
            let heartbeat_config = config.heartbeat.clone();
            let task = spec.name.clone();
            move || {
                if enforcement.is_finished() {
                    return;
                }
                let snapshot = {
                    let mut tracker = tracker.lock().expect("heartbeat tracker poisoned");
                    if let Some(sample) = monitor.latest(pid) {
                        tracker.record_resources(sample.cpu_percent, sample.rss_kb as f64 / 1024.0);
                    }
                    tracker.snapshot(scheduler.now_ms())
                };
                let verdict = heartbeat::analyze(&snapshot, &heartbeat_config);
                if verdict.should_terminate {
                    bus.emit(SupervisorEvent::HealthTerminated {
                        task: task.clone(),
                        reason: TerminationReason::Stalled,
                    });
                    enforcement.terminate(TerminationReason::Stalled);
                } else if !verdict.is_healthy || !verdict.warnings.is_empty() {
                    bus.emit(SupervisorEvent::HealthWarning {
                        task: task.clone(),
                        warnings: verdict.warnings,
                        confidence: verdict.confidence,
                    });
                }
            }
        };
        match self
            .scheduler
            .schedule_interval(Box::new(tick), config.sampler.check_interval_ms)
        {
            Ok(handle) => attempt_timers.push(handle),
            Err(err) => {
                tracing::warn!(task = %spec.name, %err, "heartbeat timer unavailable")
            }
        }
    }

    /// One-shot warnings at 50/75/90% of the attempt's execution budget.
    fn arm_timeout_warnings(
        &self,
        spec: &TaskSpec,
        timeout_ms: u64,
        enforcement: &Enforcement,
        attempt_timers: &mut Vec<TimerHandle>,
    ) {
        for (percent, numerator, denominator) in [(50u8, 1u64, 2u64), (75, 3, 4), (90, 9, 10)] {
            let delay = timeout_ms / denominator * numerator;
            let remaining_ms = timeout_ms.saturating_sub(delay);
            let warn = {
                let bus = self.bus.clone();
                let enforcement = enforcement.clone();
                let task = spec.name.clone();
                move || {
                    if enforcement.is_finished() {
                        return;
                    }
                    bus.emit(SupervisorEvent::TimeoutWarning {
                        task: task.clone(),
                        percent_elapsed: percent,
                        remaining_ms,
                    });
                }
            };
            match self.scheduler.schedule(Box::new(warn), delay) {
                Ok(handle) => attempt_timers.push(handle),
                Err(err) => {
                    tracing::warn!(task = %spec.name, %err, "timeout warning timer unavailable")
                }
            }
        }
    }
}

fn lock_tracker(tracker: &Arc<Mutex<HeartbeatTracker>>) -> std::sync::MutexGuard<'_, HeartbeatTracker> {
    tracker.lock().expect("heartbeat tracker poisoned")
}

fn finish(
    spec: &TaskSpec,
    retry: &OrchestratorRetryState,
    report: AttemptReport,
    classified_errors: Vec<ClassifiedError>,
    state_history: Vec<TaskState>,
    final_state: TaskState,
    abort_reason: Option<AbortReason>,
) -> TaskResult {
    TaskResult {
        task: spec.name.clone(),
        success: report.failure.is_none(),
        exit_code: report.result.exit_code,
        termination_reason: report.result.termination_reason,
        failure_kind: report.failure,
        abort_reason,
        attempts: retry.attempt,
        classified_errors,
        final_resource_usage: report.result.final_resource_usage,
        violations: report.result.violations,
        warnings: report.result.warnings,
        checkpoint: retry.checkpoint.clone(),
        final_state,
        state_history,
    }
}

#[cfg(test)]
#[path = "../tests/unit/orchestrator_tests.rs"]
mod tests;
