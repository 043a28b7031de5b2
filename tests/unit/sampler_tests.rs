use super::*;
use crate::timer::VirtualScheduler;
use std::sync::atomic::{AtomicU32, Ordering};

/// Probe that replays scripted samples and counts how often it was asked.
struct ScriptedProbe {
    samples: Mutex<VecDeque<Option<ResourceSample>>>,
    calls: AtomicU32,
    zombies: Vec<ResourceSample>,
}

impl ScriptedProbe {
    fn new(samples: Vec<Option<ResourceSample>>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
            calls: AtomicU32::new(0),
            zombies: Vec::new(),
        }
    }

    fn with_zombies(zombies: Vec<ResourceSample>) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            zombies,
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&self, pid: u32) -> Option<ResourceSample> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.samples
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Some(sample_for(pid, 1.0)))
    }

    fn scan_zombies(&self) -> Vec<ResourceSample> {
        self.zombies.clone()
    }
}

fn sample_for(pid: u32, cpu: f64) -> ResourceSample {
    ResourceSample {
        pid,
        parent_pid: 1,
        cpu_percent: cpu,
        memory_percent: 0.5,
        rss_kb: 10_240,
        vsz_kb: 20_480,
        state: ProcessState::Running,
        command: "claude".to_string(),
    }
}

fn monitor_with(
    probe: Arc<dyn ResourceProbe>,
    scheduler: Arc<VirtualScheduler>,
    max_history: usize,
) -> ResourceMonitor {
    ResourceMonitor::new(
        scheduler,
        probe,
        SamplerConfig {
            check_interval_ms: 100,
            max_history,
            zombie_scan_enabled: true,
        },
    )
}

#[test]
fn ps_probe_samples_current_process() {
    let probe = PsProbe;
    let pid = std::process::id();
    let sample = probe.sample(pid).expect("own process should be sampleable");
    assert_eq!(sample.pid, pid);
    assert!(sample.cpu_percent >= 0.0);
    assert!(sample.memory_percent >= 0.0);
    assert!(!sample.command.is_empty());
    assert_ne!(sample.state, ProcessState::Zombie);
}

#[test]
fn ps_probe_returns_none_for_missing_pid() {
    let probe = PsProbe;
    // PID far beyond any default pid_max; `ps` exits non-zero.
    assert_eq!(probe.sample(99_999_999), None);
}

#[test]
fn ps_probe_returns_none_after_child_is_reaped() {
    let mut child = std::process::Command::new("bash")
        .args(["-lc", "exit 0"])
        .spawn()
        .expect("spawn child");
    let pid = child.id();
    child.wait().expect("wait child");
    assert_eq!(PsProbe.sample(pid), None);
}

#[test]
fn detailed_row_parses_all_fields() {
    let sample =
        parse_detailed_row("  4242 1 12.5  3.2  51200 102400 S claude").expect("parse row");
    assert_eq!(sample.pid, 4242);
    assert_eq!(sample.parent_pid, 1);
    assert!((sample.cpu_percent - 12.5).abs() < f64::EPSILON);
    assert!((sample.memory_percent - 3.2).abs() < f64::EPSILON);
    assert_eq!(sample.rss_kb, 51_200);
    assert_eq!(sample.vsz_kb, 102_400);
    assert_eq!(sample.state, ProcessState::Sleeping);
    assert_eq!(sample.command, "claude");
}

#[test]
fn detailed_row_keeps_commands_with_spaces() {
    let sample =
        parse_detailed_row("1 0 0.0 0.0 0 0 Z claude code generate").expect("parse row");
    assert_eq!(sample.state, ProcessState::Zombie);
    assert_eq!(sample.command, "claude code generate");
}

#[test]
fn malformed_detailed_row_is_rejected() {
    assert_eq!(parse_detailed_row("not a ps row"), None);
    assert_eq!(parse_detailed_row(""), None);
    // Missing command column.
    assert_eq!(parse_detailed_row("1 0 0.0 0.0 0 0 S"), None);
}

#[test]
fn minimal_row_fallback_parses_cpu_and_memory_only() {
    let sample = parse_minimal_row(7, " 42.0  7.5 ").expect("parse minimal");
    assert_eq!(sample.pid, 7);
    assert!((sample.cpu_percent - 42.0).abs() < f64::EPSILON);
    assert!((sample.memory_percent - 7.5).abs() < f64::EPSILON);
    assert_eq!(sample.state, ProcessState::Unknown);
}

#[test]
fn monitoring_appends_history_on_each_interval() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let probe = Arc::new(ScriptedProbe::new(vec![
        Some(sample_for(9, 1.0)),
        Some(sample_for(9, 2.0)),
        Some(sample_for(9, 3.0)),
    ]));
    let monitor = monitor_with(probe.clone(), scheduler.clone(), 10);

    monitor.start_monitoring(9).expect("start monitoring");
    scheduler.advance_time(300);

    let history = monitor.history(9);
    assert_eq!(history.len(), 3);
    assert!((history[0].cpu_percent - 1.0).abs() < f64::EPSILON);
    assert!((history[2].cpu_percent - 3.0).abs() < f64::EPSILON);
    assert_eq!(probe.call_count(), 3);
}

#[test]
fn history_ring_evicts_oldest_first() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let probe = Arc::new(ScriptedProbe::new(
        (1..=5).map(|i| Some(sample_for(9, f64::from(i)))).collect(),
    ));
    let monitor = monitor_with(probe, scheduler.clone(), 3);

    monitor.start_monitoring(9).expect("start monitoring");
    scheduler.advance_time(500);

    let history = monitor.history(9);
    assert_eq!(history.len(), 3);
    assert!((history[0].cpu_percent - 3.0).abs() < f64::EPSILON);
    assert!((history[2].cpu_percent - 5.0).abs() < f64::EPSILON);
}

#[test]
fn duplicate_start_monitoring_is_a_noop() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let probe = Arc::new(ScriptedProbe::new(Vec::new()));
    let monitor = monitor_with(probe.clone(), scheduler.clone(), 10);

    monitor.start_monitoring(9).expect("start");
    monitor.start_monitoring(9).expect("duplicate start");
    scheduler.advance_time(100);

    // A duplicate registration would have sampled twice per interval.
    assert_eq!(probe.call_count(), 1);
    assert_eq!(monitor.history(9).len(), 1);
}

#[test]
fn stop_monitoring_is_idempotent_and_keeps_history() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let probe = Arc::new(ScriptedProbe::new(vec![Some(sample_for(9, 1.0))]));
    let monitor = monitor_with(probe.clone(), scheduler.clone(), 10);

    monitor.start_monitoring(9).expect("start");
    scheduler.advance_time(100);
    monitor.stop_monitoring(9);
    monitor.stop_monitoring(9);
    scheduler.advance_time(500);

    assert!(!monitor.is_monitoring(9));
    assert_eq!(probe.call_count(), 1);
    assert_eq!(monitor.history(9).len(), 1, "history survives stop");
}

#[test]
fn stop_all_cancels_every_watch() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let probe = Arc::new(ScriptedProbe::new(Vec::new()));
    let monitor = monitor_with(probe.clone(), scheduler.clone(), 10);

    monitor.start_monitoring(1).expect("start");
    monitor.start_monitoring(2).expect("start");
    monitor.stop_all();
    scheduler.advance_time(1_000);

    assert_eq!(probe.call_count(), 0);
    assert!(!monitor.is_monitoring(1));
    assert!(!monitor.is_monitoring(2));
}

#[test]
fn failed_sample_keeps_previous_history() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let probe = Arc::new(ScriptedProbe::new(vec![
        Some(sample_for(9, 1.0)),
        None,
        Some(sample_for(9, 2.0)),
    ]));
    let monitor = monitor_with(probe, scheduler.clone(), 10);

    monitor.start_monitoring(9).expect("start");
    scheduler.advance_time(300);

    let history = monitor.history(9);
    assert_eq!(history.len(), 2, "missing sample is skipped, not recorded");
    assert!((history[1].cpu_percent - 2.0).abs() < f64::EPSILON);
}

#[test]
fn zombie_scan_respects_config_switch() {
    let scheduler = Arc::new(VirtualScheduler::new());
    let zombie = ResourceSample {
        state: ProcessState::Zombie,
        ..sample_for(13, 0.0)
    };
    let probe = Arc::new(ScriptedProbe::with_zombies(vec![zombie.clone()]));

    let enabled = ResourceMonitor::new(
        scheduler.clone(),
        probe.clone(),
        SamplerConfig {
            check_interval_ms: 100,
            max_history: 10,
            zombie_scan_enabled: true,
        },
    );
    assert_eq!(enabled.detect_zombie_processes(), vec![zombie]);

    let disabled = ResourceMonitor::new(
        scheduler,
        probe,
        SamplerConfig {
            check_interval_ms: 100,
            max_history: 10,
            zombie_scan_enabled: false,
        },
    );
    assert!(disabled.detect_zombie_processes().is_empty());
}
