//! Notification sinks
//!
//! A [`Notifier`] observes workflow progress. It never influences control
//! flow.

use crate::report::Report;
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Observer of step progress
pub trait Notifier: Send + Sync {
    fn step_started(&self, step: &str);

    fn step_failed(&self, report: &Report);

    fn step_completed(&self, report: &Report);
}

/// Progress event emitted by [`EventNotifier`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepStarted { step: String },
    StepFailed { step: String, report: Report },
    StepCompleted { step: String, report: Report },
}

impl WorkflowEvent {
    pub fn step(&self) -> &str {
        match self {
            WorkflowEvent::StepStarted { step }
            | WorkflowEvent::StepFailed { step, .. }
            | WorkflowEvent::StepCompleted { step, .. } => step,
        }
    }
}

/// Notifier that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn step_started(&self, _step: &str) {}

    fn step_failed(&self, _report: &Report) {}

    fn step_completed(&self, _report: &Report) {}
}

/// Notifier that emits structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn step_started(&self, step: &str) {
        info!(step = %step, "Step started");
    }

    fn step_failed(&self, report: &Report) {
        let (kind, message, hint) = match report.error() {
            Some(err) => (
                err.kind().to_string(),
                err.message().to_string(),
                err.hint().unwrap_or_default().to_string(),
            ),
            None => Default::default(),
        };
        error!(
            step = %report.id(),
            kind = %kind,
            error = %message,
            hint = %hint,
            "Step failed"
        );
    }

    fn step_completed(&self, report: &Report) {
        info!(
            step = %report.id(),
            status = %report.status(),
            metadata = ?report.metadata(),
            "Step completed"
        );
    }
}

/// Notifier that records events in memory
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: WorkflowEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Compact `started:<id>` / `failed:<id>` / `completed:<id>` trace
    pub fn trace(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| match e {
                WorkflowEvent::StepStarted { step } => format!("started:{step}"),
                WorkflowEvent::StepFailed { step, .. } => format!("failed:{step}"),
                WorkflowEvent::StepCompleted { step, .. } => format!("completed:{step}"),
            })
            .collect()
    }
}

impl Notifier for CollectingNotifier {
    fn step_started(&self, step: &str) {
        self.push(WorkflowEvent::StepStarted {
            step: step.to_string(),
        });
    }

    fn step_failed(&self, report: &Report) {
        self.push(WorkflowEvent::StepFailed {
            step: report.id().to_string(),
            report: report.clone(),
        });
    }

    fn step_completed(&self, report: &Report) {
        self.push(WorkflowEvent::StepCompleted {
            step: report.id().to_string(),
            report: report.clone(),
        });
    }
}

/// Notifier that broadcasts events to subscribers
#[derive(Debug, Clone)]
pub struct EventNotifier {
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl Notifier for EventNotifier {
    fn step_started(&self, step: &str) {
        self.emit(WorkflowEvent::StepStarted {
            step: step.to_string(),
        });
    }

    fn step_failed(&self, report: &Report) {
        self.emit(WorkflowEvent::StepFailed {
            step: report.id().to_string(),
            report: report.clone(),
        });
    }

    fn step_completed(&self, report: &Report) {
        self.emit(WorkflowEvent::StepCompleted {
            step: report.id().to_string(),
            report: report.clone(),
        });
    }
}
