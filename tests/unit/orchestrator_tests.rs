use super::*;
use crate::config::ConfigOverrides;
use crate::sampler::PsProbe;
use crate::timer::SystemScheduler;
use std::sync::mpsc::Receiver;

fn retry_config() -> RetryConfig {
    RetryConfig::default()
}

fn state_after(failures: &[FailureKind], attempt: u32) -> OrchestratorRetryState {
    let mut state = OrchestratorRetryState::new(600_000);
    for kind in failures {
        state.record_failure(*kind);
    }
    state.attempt = attempt;
    state
}

#[test]
fn fatal_failure_kinds_are_never_retried() {
    for kind in [FailureKind::Auth, FailureKind::RateLimit, FailureKind::Model] {
        let state = state_after(&[kind], 1);
        let decision = decide_after_failure(
            kind,
            &state,
            &retry_config(),
            &DefaultTimeoutPolicy,
            600_000,
            1.0,
            5_000,
        );
        assert_eq!(
            decision,
            RetryDecision::Abort {
                reason: AbortReason::NotRetryable
            },
            "{kind:?}"
        );
    }
}

#[test]
fn transient_failures_retry_until_the_pattern_repeats() {
    let first = state_after(&[FailureKind::Network], 1);
    let decision = decide_after_failure(
        FailureKind::Network,
        &first,
        &retry_config(),
        &DefaultTimeoutPolicy,
        600_000,
        1.0,
        5_000,
    );
    assert!(matches!(decision, RetryDecision::Retry { .. }));

    let second = state_after(&[FailureKind::Network, FailureKind::Network], 2);
    let decision = decide_after_failure(
        FailureKind::Network,
        &second,
        &retry_config(),
        &DefaultTimeoutPolicy,
        600_000,
        1.0,
        5_000,
    );
    assert_eq!(
        decision,
        RetryDecision::Abort {
            reason: AbortReason::RepeatingFailurePattern
        }
    );
}

#[test]
fn alternating_failure_kinds_still_hit_the_attempt_cap() {
    let state = state_after(&[FailureKind::Network, FailureKind::Generic, FailureKind::Timeout], 3);
    let decision = decide_after_failure(
        FailureKind::Timeout,
        &state,
        &retry_config(),
        &DefaultTimeoutPolicy,
        600_000,
        1.0,
        5_000,
    );
    assert_eq!(
        decision,
        RetryDecision::Abort {
            reason: AbortReason::MaxAttemptsReached
        }
    );
}

#[test]
fn default_policy_scales_with_complexity_and_clamps_at_four_times_base() {
    let policy = DefaultTimeoutPolicy;
    assert_eq!(
        policy.next_timeout_ms(10_000, 1.0, 0, FailureKind::Generic),
        10_000
    );
    assert_eq!(
        policy.next_timeout_ms(10_000, 2.0, 0, FailureKind::Generic),
        20_000
    );
    // Sub-unit complexity never shrinks the budget.
    assert_eq!(
        policy.next_timeout_ms(10_000, 0.5, 0, FailureKind::Generic),
        10_000
    );
    // A timed-out attempt gets half again its prior elapsed time.
    assert_eq!(
        policy.next_timeout_ms(10_000, 1.0, 16_000, FailureKind::Timeout),
        24_000
    );
    assert_eq!(
        policy.next_timeout_ms(10_000, 1.0, 16_000, FailureKind::Stalled),
        24_000
    );
    // Prior elapsed time does not inflate non-timeout retries.
    assert_eq!(
        policy.next_timeout_ms(10_000, 1.0, 16_000, FailureKind::Network),
        10_000
    );
    assert_eq!(
        policy.next_timeout_ms(10_000, 1.0, 100_000, FailureKind::Timeout),
        40_000
    );
}

fn harness() -> (Orchestrator, Arc<EventBus>, Receiver<SupervisorEvent>) {
    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe();
    let orchestrator = Orchestrator::new(
        Arc::new(SystemScheduler::new()),
        Arc::new(PsProbe),
        bus.clone(),
    );
    (orchestrator, bus, events)
}

fn bash_task(name: &str, script: &str) -> TaskSpec {
    TaskSpec::new(name, "bash", vec!["-c".to_string(), script.to_string()])
}

fn drain(events: &Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

#[test]
fn clean_exit_succeeds_with_no_violations_or_warnings() {
    let (orchestrator, _bus, _events) = harness();
    let result = orchestrator.run_task(&bash_task("clean", "exit 0"), &WardenConfig::default());

    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.attempts, 1);
    assert_eq!(result.failure_kind, None);
    assert_eq!(result.termination_reason, None);
    assert!(result.violations.is_empty());
    assert!(result.warnings.is_empty());
    assert!(result.classified_errors.is_empty());
    assert_eq!(result.final_state, TaskState::Succeeded);
    assert_eq!(
        result.state_history,
        vec![TaskState::Idle, TaskState::Running, TaskState::Succeeded]
    );
}

#[test]
fn authentication_failure_is_terminal_after_one_attempt() {
    let (orchestrator, _bus, events) = harness();
    let result = orchestrator.run_task(
        &bash_task("auth", "echo 'Error: Authentication failed' >&2; exit 1"),
        &WardenConfig::default(),
    );

    assert!(!result.success);
    assert_eq!(result.attempts, 1, "auth failures are never retried");
    assert_eq!(result.failure_kind, Some(FailureKind::Auth));
    assert_eq!(result.abort_reason, Some(AbortReason::NotRetryable));
    assert_eq!(result.final_state, TaskState::Terminated);

    assert_eq!(result.classified_errors.len(), 1);
    let error = &result.classified_errors[0];
    assert_eq!(error.kind, crate::classifier::ErrorKind::Auth);
    assert!(error.is_fatal());

    let emitted = drain(&events);
    assert!(
        emitted
            .iter()
            .any(|event| matches!(event, SupervisorEvent::ErrorDetected { .. }))
    );
}

#[test]
fn transient_failures_retry_up_to_the_attempt_cap() {
    let (orchestrator, _bus, _events) = harness();
    let mut spec = bash_task("flaky", "exit 1");
    spec.overrides = ConfigOverrides {
        max_attempts: Some(3),
        pattern_threshold: Some(10),
        ..ConfigOverrides::default()
    };
    let result = orchestrator.run_task(&spec, &WardenConfig::default());

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.failure_kind, Some(FailureKind::Generic));
    assert_eq!(result.abort_reason, Some(AbortReason::MaxAttemptsReached));
    assert_eq!(
        result
            .state_history
            .iter()
            .filter(|state| **state == TaskState::Retrying)
            .count(),
        2
    );
}

#[test]
fn a_repeating_failure_kind_trips_the_circuit_breaker_early() {
    let (orchestrator, _bus, _events) = harness();
    let mut spec = bash_task("breaker", "exit 1");
    spec.overrides = ConfigOverrides {
        max_attempts: Some(5),
        ..ConfigOverrides::default()
    };
    let result = orchestrator.run_task(&spec, &WardenConfig::default());

    // Default pattern threshold is two repeats of the same kind.
    assert_eq!(result.attempts, 2);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::RepeatingFailurePattern)
    );
}

#[test]
fn checkpoint_payloads_survive_into_the_failed_result() {
    let (orchestrator, _bus, _events) = harness();
    let mut spec = bash_task("ckpt", "echo 'CHECKPOINT: step-3'; exit 1");
    spec.overrides = ConfigOverrides {
        max_attempts: Some(2),
        pattern_threshold: Some(10),
        ..ConfigOverrides::default()
    };
    let result = orchestrator.run_task(&spec, &WardenConfig::default());

    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.checkpoint.as_deref(), Some("step-3"));
    assert_eq!(result.final_state, TaskState::CheckpointedFailed);
}

#[test]
fn progressive_timeout_warnings_fire_once_each_in_order() {
    let (orchestrator, _bus, events) = harness();
    let mut spec = bash_task("slow", "exec sleep 5");
    spec.overrides = ConfigOverrides {
        execution_timeout_ms: Some(1_000),
        warning_timeout_ms: Some(800),
        grace_period_ms: Some(200),
        max_attempts: Some(1),
        check_interval_ms: Some(100),
        ..ConfigOverrides::default()
    };
    let result = orchestrator.run_task(&spec, &WardenConfig::default());

    assert!(!result.success);
    assert_eq!(result.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(
        result.termination_reason,
        Some(TerminationReason::ExecutionTimeout)
    );
    assert_eq!(result.attempts, 1);

    let percents: Vec<u8> = drain(&events)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::TimeoutWarning {
                percent_elapsed, ..
            } => Some(percent_elapsed),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![50, 75, 90]);
}

#[test]
fn a_silent_process_is_terminated_as_stalled() {
    let (orchestrator, _bus, events) = harness();
    let mut spec = bash_task("silent", "exec sleep 5");
    spec.overrides = ConfigOverrides {
        max_silence_ms: Some(300),
        analysis_window_ms: Some(2_000),
        check_interval_ms: Some(100),
        grace_period_ms: Some(200),
        max_attempts: Some(1),
        ..ConfigOverrides::default()
    };
    let result = orchestrator.run_task(&spec, &WardenConfig::default());

    assert!(!result.success);
    assert_eq!(result.failure_kind, Some(FailureKind::Stalled));
    assert_eq!(result.termination_reason, Some(TerminationReason::Stalled));

    assert!(
        drain(&events).iter().any(|event| matches!(
            event,
            SupervisorEvent::HealthTerminated {
                reason: TerminationReason::Stalled,
                ..
            }
        ))
    );
}

#[test]
fn spawn_failure_is_immediate_and_non_retryable() {
    let (orchestrator, _bus, _events) = harness();
    let spec = TaskSpec::new("ghost", "definitely-not-a-real-binary-7c1f", Vec::new());
    let result = orchestrator.run_task(&spec, &WardenConfig::default());

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.failure_kind, Some(FailureKind::Spawn));
    assert_eq!(result.termination_reason, Some(TerminationReason::MissingPid));
    assert_eq!(result.abort_reason, Some(AbortReason::NotRetryable));
    assert!(!result.warnings.is_empty(), "spawn error text is preserved");
}

#[test]
fn cancellation_stops_the_task_and_keeps_diagnostics() {
    let (orchestrator, _bus, _events) = harness();
    let mut spec = bash_task("cancel", "echo started; exec sleep 5");
    spec.overrides = ConfigOverrides {
        grace_period_ms: Some(200),
        check_interval_ms: Some(100),
        ..ConfigOverrides::default()
    };
    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = cancel.clone();
    let flipper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.store(true, Ordering::SeqCst);
    });

    let result =
        orchestrator.run_task_cancellable(&spec, &WardenConfig::default(), &cancel);
    flipper.join().expect("flipper thread");

    assert!(!result.success);
    assert_eq!(result.failure_kind, Some(FailureKind::Cancelled));
    assert_eq!(result.termination_reason, Some(TerminationReason::Cancelled));
    assert_eq!(result.attempts, 1);
    assert_eq!(result.final_state, TaskState::Terminated);
}
