//! Step trait and built-in steps

use crate::context::StepContext;
use crate::error::{ErrorKind, Result, StepError};
use crate::ledger::{Ledger, Lifecycle};
use crate::report::Report;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// An atomic unit of provisioning work
///
/// `execute` checks whether its target state already holds, does the work
/// if not, and records what it did. `rollback` undoes only what the most
/// recent `execute` recorded.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique identifier within a workflow
    fn id(&self) -> &str;

    /// Human-readable description for plans and logs
    fn description(&self) -> String {
        self.id().to_string()
    }

    /// Augment the context before `execute`
    ///
    /// An error here fails the step without executing it.
    async fn prepare(&self, ctx: StepContext) -> Result<StepContext> {
        Ok(ctx)
    }

    async fn execute(&self, ctx: &StepContext) -> Report;

    async fn rollback(&self, ctx: &StepContext) -> Report;

    /// Called after `execute` returned a failed report
    fn on_failure(&self, _report: &Report) {}

    /// Called after `execute` returned a successful or skipped report
    fn on_completion(&self, _report: &Report) {}

    /// Nested steps, for plan rendering
    fn children(&self) -> Vec<&dyn Step> {
        Vec::new()
    }

    /// Current lifecycle, when the step tracks one
    fn lifecycle(&self) -> Option<Lifecycle> {
        None
    }
}

/// A step that succeeds without doing anything
#[derive(Debug)]
pub struct NoopStep {
    id: String,
}

impl NoopStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Step for NoopStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: &StepContext) -> Report {
        Report::success(&self.id)
    }

    async fn rollback(&self, _ctx: &StepContext) -> Report {
        Report::skipped(&self.id)
    }
}

/// A step that always fails
#[derive(Debug)]
pub struct FailingStep {
    id: String,
    kind: ErrorKind,
    message: String,
}

impl FailingStep {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl Step for FailingStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: &StepContext) -> Report {
        Report::failed(&self.id, StepError::new(self.kind, &self.message))
    }

    async fn rollback(&self, _ctx: &StepContext) -> Report {
        Report::skipped(&self.id)
    }
}

/// Shared, ordered log of step calls
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeed,
    Skip,
    Fail,
    /// Record work, then fail
    FailAfterWork,
}

/// Step with scripted behavior that writes every call to a [`Journal`]
///
/// Entries are `prepare:<id>`, `execute:<id>` and `rollback:<id>`. Rollback
/// only undoes (and journals) when `execute` recorded work.
#[derive(Debug)]
pub struct ScriptedStep {
    id: String,
    journal: Journal,
    outcome: Outcome,
    fail_prepare: bool,
    fail_rollback: bool,
    cancel: Option<CancellationToken>,
    ledger: Ledger<bool>,
}

impl ScriptedStep {
    pub fn new(id: impl Into<String>, journal: &Journal) -> Self {
        Self {
            id: id.into(),
            journal: journal.clone(),
            outcome: Outcome::Succeed,
            fail_prepare: false,
            fail_rollback: false,
            cancel: None,
            ledger: Ledger::new(),
        }
    }

    /// Report Skipped: target state already holds
    pub fn skipping(mut self) -> Self {
        self.outcome = Outcome::Skip;
        self
    }

    /// Fail before doing any work
    pub fn failing(mut self) -> Self {
        self.outcome = Outcome::Fail;
        self
    }

    /// Do work, then fail
    pub fn failing_after_work(mut self) -> Self {
        self.outcome = Outcome::FailAfterWork;
        self
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// Cancel `token` while executing
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn prepare(&self, ctx: StepContext) -> Result<StepContext> {
        self.journal.push(format!("prepare:{}", self.id));
        if self.fail_prepare {
            return Err(StepError::internal(format!("{} cannot prepare", self.id)));
        }
        Ok(ctx)
    }

    async fn execute(&self, _ctx: &StepContext) -> Report {
        self.ledger.begin();
        self.journal.push(format!("execute:{}", self.id));

        if let Some(token) = &self.cancel {
            token.cancel();
        }

        let report = match self.outcome {
            Outcome::Succeed => {
                self.ledger.record(|worked| *worked = true);
                Report::success(&self.id)
            }
            Outcome::Skip => Report::skipped(&self.id),
            Outcome::Fail => Report::failed(
                &self.id,
                StepError::new(ErrorKind::Installation, format!("{} failed", self.id)),
            ),
            Outcome::FailAfterWork => {
                self.ledger.record(|worked| *worked = true);
                Report::failed(
                    &self.id,
                    StepError::new(ErrorKind::Cleanup, format!("{} failed", self.id)),
                )
            }
        };
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, _ctx: &StepContext) -> Report {
        match self.ledger.take_for_rollback() {
            Some(true) => {
                self.journal.push(format!("rollback:{}", self.id));
                if self.fail_rollback {
                    Report::failed(
                        &self.id,
                        StepError::new(ErrorKind::Installation, format!("{} rollback failed", self.id)),
                    )
                } else {
                    Report::success(&self.id)
                }
            }
            _ => Report::skipped(&self.id),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}
