use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

use serde::Serialize;

use crate::classifier::ClassifiedError;
use crate::enforcer::TerminationReason;

/// Observability notifications published by the orchestrator. Consumers
/// subscribe independently; the core never formats human-readable output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SupervisorEvent {
    HealthWarning {
        task: String,
        warnings: Vec<String>,
        confidence: f64,
    },
    HealthTerminated {
        task: String,
        reason: TerminationReason,
    },
    ErrorDetected {
        task: String,
        error: ClassifiedError,
    },
    TimeoutWarning {
        task: String,
        percent_elapsed: u8,
        remaining_ms: u64,
    },
}

/// Fan-out publisher. Each subscriber gets its own channel; a dropped
/// receiver is pruned silently on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SupervisorEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SupervisorEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .push(tx);
        rx
    }

    pub fn emit(&self, event: SupervisorEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
