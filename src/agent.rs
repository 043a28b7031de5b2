use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// One line or lifecycle notice from the supervised subprocess. Stdout and
/// stderr are kept apart because only stderr feeds the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Stdout(String),
    Stderr(String),
    System(String),
    Exited { success: bool, code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct AgentCommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub model: Option<String>,
}

impl AgentCommandConfig {
    pub fn default_claude() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--output-format".to_string(),
                "json".to_string(),
                "-p".to_string(),
            ],
            model: None,
        }
    }

    /// Full argument list for one attempt. A retry that carries a checkpoint
    /// gets it injected as a resume argument; the payload itself is opaque.
    pub fn command_args(&self, checkpoint: Option<&str>) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(model) = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(checkpoint) = checkpoint {
            args.push("--resume".to_string());
            args.push(checkpoint.to_string());
        }
        args
    }
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self::default_claude()
    }
}

/// Running subprocess attempt. Output arrives on an event channel fed by
/// reader threads; the handle never blocks on subprocess I/O itself.
pub struct AgentHandle {
    event_rx: Receiver<AgentEvent>,
    pid: Option<u32>,
}

impl AgentHandle {
    /// Spawn one attempt. A spawn failure is reported as events on the
    /// returned handle, not as an error; the handle then has no PID.
    pub fn spawn(config: &AgentCommandConfig, checkpoint: Option<&str>) -> Self {
        let (event_tx, event_rx) = mpsc::channel();

        let mut command = Command::new(&config.program);
        command
            .args(config.command_args(checkpoint))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = event_tx.send(AgentEvent::System(format!(
                    "failed to start {}: {err}",
                    config.program
                )));
                let _ = event_tx.send(AgentEvent::Exited {
                    success: false,
                    code: None,
                });
                return Self {
                    event_rx,
                    pid: None,
                };
            }
        };
        let pid = child.id();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, event_tx.clone(), AgentEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, event_tx.clone(), AgentEvent::Stderr));
        }

        thread::spawn(move || {
            for reader in readers {
                let _ = reader.join();
            }
            emit_exit_event(&event_tx, child.wait());
        });

        Self {
            event_rx,
            pid: Some(pid),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn drain_events_limited(&self, max_events: usize) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        if max_events == 0 {
            return events;
        }
        while events.len() < max_events {
            let Ok(event) = self.event_rx.try_recv() else {
                break;
            };
            events.push(event);
        }
        events
    }

    /// Block for the next event, up to `timeout`. `None` means either the
    /// timeout elapsed or every sender is gone.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<AgentEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    tx: Sender<AgentEvent>,
    wrap: fn(String) -> AgentEvent,
) -> thread::JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(reader).lines().map_while(Result::ok) {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    })
}

fn emit_exit_event(
    tx: &Sender<AgentEvent>,
    wait_result: std::io::Result<std::process::ExitStatus>,
) {
    match wait_result {
        Ok(status) => {
            let _ = tx.send(AgentEvent::Exited {
                success: status.success(),
                code: status.code(),
            });
        }
        Err(err) => {
            let _ = tx.send(AgentEvent::System(format!(
                "failed while waiting for subprocess: {err}"
            )));
            let _ = tx.send(AgentEvent::Exited {
                success: false,
                code: None,
            });
        }
    }
}

#[cfg(test)]
#[path = "../tests/unit/agent_tests.rs"]
mod tests;
