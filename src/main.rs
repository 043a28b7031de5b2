mod agent;
mod classifier;
mod config;
mod enforcer;
mod events;
mod health;
mod heartbeat;
mod orchestrator;
mod sampler;
mod timer;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{TaskSpec, WardenConfig};
use crate::events::{EventBus, SupervisorEvent};
use crate::orchestrator::Orchestrator;
use crate::sampler::{PsProbe, ResourceProbe};
use crate::timer::SystemScheduler;

#[derive(Parser)]
#[command(
    name = "taskwarden",
    about = "Supervises long-running AI coding-assistant subprocesses"
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Supervise one subprocess task and print its result as JSON.
    Run {
        /// TOML configuration file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Task name used in events and logs.
        #[arg(long, default_value = "task")]
        name: String,
        /// Model selection passed through to the subprocess.
        #[arg(long)]
        model: Option<String>,
        /// Complexity hint scaling the adaptive retry timeout.
        #[arg(long, default_value_t = 1.0)]
        complexity: f64,
        /// Stdout prefix marking checkpoint payload lines.
        #[arg(long)]
        checkpoint_marker: Option<String>,
        /// Subprocess command and arguments, after `--`.
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        subprocess: Vec<String>,
    },
    /// Print one resource sample for a PID as JSON (null when gone).
    Sample {
        #[arg(long)]
        pid: u32,
    },
    /// Score a PID's health from a fresh resource sample, as JSON.
    Health {
        /// TOML configuration file supplying the scoring thresholds.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        pid: u32,
    },
    /// Print a system-wide zombie process scan as JSON.
    Zombies,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        CliCommand::Run {
            config,
            name,
            model,
            complexity,
            checkpoint_marker,
            subprocess,
        } => {
            let base_config = match config {
                Some(path) => WardenConfig::load(&path)?,
                None => WardenConfig::default(),
            };
            let (program, args) = subprocess
                .split_first()
                .ok_or("subprocess command is required after --")?;

            let mut spec = TaskSpec::new(&name, program, args.to_vec());
            spec.model = model;
            spec.complexity = complexity;
            spec.overrides.checkpoint_marker = checkpoint_marker;

            let bus = Arc::new(EventBus::new());
            forward_events_to_logs(&bus);

            let orchestrator = Orchestrator::new(
                Arc::new(SystemScheduler::new()),
                Arc::new(PsProbe),
                bus,
            );
            let result = orchestrator.run_task(&spec, &base_config);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.success { 0 } else { 1 })
        }
        CliCommand::Sample { pid } => {
            let sample = PsProbe.sample(pid);
            println!("{}", serde_json::to_string_pretty(&sample)?);
            Ok(0)
        }
        CliCommand::Health { config, pid } => {
            let config = match config {
                Some(path) => WardenConfig::load(&path)?,
                None => WardenConfig::default(),
            };
            let sample = PsProbe.sample(pid);
            let metrics = health::score(sample.as_ref(), &config.health);
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(0)
        }
        CliCommand::Zombies => {
            let zombies = PsProbe.scan_zombies();
            println!("{}", serde_json::to_string_pretty(&zombies)?);
            Ok(0)
        }
    }
}

/// The core publishes events, never formats output; the binary boundary is
/// where they become log lines.
fn forward_events_to_logs(bus: &Arc<EventBus>) {
    let events = bus.subscribe();
    thread::spawn(move || {
        while let Ok(event) = events.recv() {
            match event {
                SupervisorEvent::HealthWarning {
                    task, warnings, ..
                } => {
                    tracing::warn!(%task, ?warnings, "health warning");
                }
                SupervisorEvent::HealthTerminated { task, reason } => {
                    tracing::warn!(%task, reason = reason.describe(), "health termination");
                }
                SupervisorEvent::ErrorDetected { task, error } => {
                    tracing::warn!(%task, kind = ?error.kind, message = %error.message, "classified error");
                }
                SupervisorEvent::TimeoutWarning {
                    task,
                    percent_elapsed,
                    remaining_ms,
                } => {
                    tracing::warn!(%task, percent_elapsed, remaining_ms, "timeout approaching");
                }
            }
        }
    });
}
