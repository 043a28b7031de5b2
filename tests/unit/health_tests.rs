use super::*;
use crate::sampler::ProcessState;

fn sample(cpu: f64, memory: f64, state: ProcessState) -> ResourceSample {
    ResourceSample {
        pid: 321,
        parent_pid: 1,
        cpu_percent: cpu,
        memory_percent: memory,
        rss_kb: 4_096,
        vsz_kb: 8_192,
        state,
        command: "claude".to_string(),
    }
}

fn config() -> HealthScoreConfig {
    HealthScoreConfig::default()
}

#[test]
fn quiet_healthy_process_scores_one_hundred_with_no_warnings() {
    let sample = sample(5.0, 10.0, ProcessState::Running);
    let metrics = score(Some(&sample), &config());

    assert!(metrics.is_alive);
    assert!(!metrics.is_zombie);
    assert!(!metrics.is_high_resource);
    assert_eq!(metrics.health_score, 100);
    assert!(metrics.warnings.is_empty());
    assert!(metrics.recommendations.is_empty());
    assert_eq!(metrics.sample.as_ref(), Some(&sample));
}

#[test]
fn zombie_state_deducts_fifty_and_recommends_reaping() {
    let metrics = score(Some(&sample(5.0, 10.0, ProcessState::Zombie)), &config());

    assert!(metrics.is_zombie);
    assert_eq!(metrics.health_score, 50);
    assert!(
        metrics
            .warnings
            .iter()
            .any(|warning| warning == "Process is in zombie state")
    );
    assert!(
        metrics
            .recommendations
            .iter()
            .any(|rec| rec == "Parent process should reap zombie child")
    );
}

#[test]
fn high_cpu_and_memory_each_deduct_twenty() {
    let metrics = score(Some(&sample(95.0, 10.0, ProcessState::Running)), &config());
    assert!(metrics.is_high_resource);
    assert_eq!(metrics.health_score, 80);
    assert!(metrics.warnings.iter().any(|w| w.contains("95.0%")));

    let metrics = score(Some(&sample(95.0, 85.0, ProcessState::Running)), &config());
    assert_eq!(metrics.health_score, 60);
    assert_eq!(metrics.warnings.len(), 2);
}

#[test]
fn threshold_boundary_counts_as_high_resource() {
    let metrics = score(Some(&sample(80.0, 10.0, ProcessState::Running)), &config());
    assert!(metrics.is_high_resource);
    assert_eq!(metrics.health_score, 80);
}

#[test]
fn zero_cpu_and_memory_flags_stale_process() {
    let metrics = score(Some(&sample(0.0, 0.0, ProcessState::Sleeping)), &config());

    assert!(metrics.is_alive);
    assert_eq!(metrics.health_score, 70);
    assert!(
        metrics
            .warnings
            .iter()
            .any(|warning| warning.contains("stale or unresponsive"))
    );
}

#[test]
fn stale_rule_does_not_apply_to_zombies() {
    let metrics = score(Some(&sample(0.0, 0.0, ProcessState::Zombie)), &config());

    // Zombie penalty only: the zombie rule already explains the zeros.
    assert_eq!(metrics.health_score, 50);
    assert!(
        !metrics
            .warnings
            .iter()
            .any(|warning| warning.contains("stale"))
    );
}

#[test]
fn deductions_stack_additively() {
    // Zombie (-50) plus high CPU (-20) plus high memory (-20).
    let metrics = score(Some(&sample(99.0, 90.0, ProcessState::Zombie)), &config());
    assert_eq!(metrics.health_score, 10);
    assert_eq!(metrics.warnings.len(), 3);
}

#[test]
fn zero_thresholds_apply_resource_penalties_to_any_sample() {
    let harsh = HealthScoreConfig {
        cpu_threshold: 0.0,
        memory_threshold: 0.0,
    };
    let metrics = score(Some(&sample(0.0, 0.0, ProcessState::Zombie)), &harsh);
    assert_eq!(metrics.health_score, 10); // 100 - 50 - 20 - 20
}

#[test]
fn missing_sample_short_circuits_to_dead() {
    let metrics = score(None, &config());

    assert!(!metrics.is_alive);
    assert!(!metrics.is_zombie);
    assert!(!metrics.is_high_resource);
    assert_eq!(metrics.health_score, 0);
    assert_eq!(
        metrics.warnings,
        vec!["Process not found or not accessible".to_string()]
    );
    assert!(metrics.sample.is_none());
}
