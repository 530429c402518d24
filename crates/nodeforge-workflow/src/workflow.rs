//! Workflow composition and cascading rollback

use crate::context::StepContext;
use crate::error::{BuildError, StepError};
use crate::ledger::{Ledger, Lifecycle};
use crate::report::Report;
use crate::step::Step;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-execution state of a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default)]
struct RunRecord {
    state: WorkflowState,
    /// Indices of steps that returned Success or Skipped, in execution order
    completed: Vec<usize>,
}

/// Ordered, fail-fast composition of steps
///
/// Steps run one at a time. On the first failure the workflow stops and
/// rolls back the failing step and then every step that already ran, in
/// reverse order. A workflow is itself a [`Step`] and can be nested.
pub struct Workflow {
    id: String,
    steps: Vec<Box<dyn Step>>,
    ledger: Ledger<RunRecord>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("steps", &self.steps.iter().map(|s| s.id()).collect::<Vec<_>>())
            .field("lifecycle", &self.ledger.lifecycle())
            .finish()
    }
}

impl Workflow {
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &dyn Step> {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// State of the most recent execution
    pub fn state(&self) -> WorkflowState {
        self.ledger.snapshot().state
    }

    /// Roll back the failing step and then `completed`, newest first
    async fn cascade(
        &self,
        ctx: &StepContext,
        reports: &mut [Report],
        failed: Option<usize>,
        completed: &[usize],
    ) {
        let rollback_ctx = ctx.detached();
        let order = completed.iter().copied().chain(failed).rev();

        for index in order {
            let step = &self.steps[index];
            debug!(workflow = %self.id, step = %step.id(), "Rolling back step");

            let rollback = step.rollback(&rollback_ctx).await;
            if let Some(err) = rollback.error() {
                warn!(
                    workflow = %self.id,
                    step = %step.id(),
                    error = %err,
                    "Rollback failed, continuing"
                );
            }
            reports[index].attach_rollback(rollback);
        }
    }
}

#[async_trait]
impl Step for Workflow {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        let start = Instant::now();
        self.ledger.begin();
        self.ledger.record(|r| r.state = WorkflowState::Running);

        info!(workflow = %self.id, steps = self.steps.len(), "Starting workflow");

        let mut reports: Vec<Report> = Vec::with_capacity(self.steps.len());
        let mut completed: Vec<usize> = Vec::new();
        // (index of a step whose execute ran, triggering error)
        let mut failure: Option<(Option<usize>, StepError)> = None;

        for (index, step) in self.steps.iter().enumerate() {
            if let Err(interrupt) = ctx.check() {
                warn!(workflow = %self.id, step = %step.id(), reason = %interrupt, "Workflow interrupted");
                let err = StepError::from(interrupt);
                reports.push(Report::failed(step.id(), err.clone()));
                failure = Some((None, err));
                break;
            }

            let step_ctx = match step.prepare(ctx.clone()).await {
                Ok(step_ctx) => step_ctx,
                Err(err) => {
                    let report = Report::failed(step.id(), err.clone());
                    ctx.notifier().step_failed(&report);
                    reports.push(report);
                    failure = Some((None, err));
                    break;
                }
            };

            ctx.notifier().step_started(step.id());
            let step_start = Instant::now();
            let mut report = step.execute(&step_ctx).await;
            if report.duration().is_none() {
                report = report.with_duration(step_start.elapsed());
            }

            match report.error().cloned() {
                Some(err) => {
                    ctx.notifier().step_failed(&report);
                    step.on_failure(&report);
                    reports.push(report);
                    failure = Some((Some(index), err));
                    break;
                }
                None => {
                    ctx.notifier().step_completed(&report);
                    step.on_completion(&report);
                    reports.push(report);
                    completed.push(index);
                    self.ledger.record(|r| r.completed.push(index));
                }
            }
        }

        let report = match failure {
            Some((failed, err)) => {
                warn!(
                    workflow = %self.id,
                    error = %err,
                    completed = completed.len(),
                    "Workflow failed, rolling back"
                );
                self.cascade(ctx, &mut reports, failed, &completed).await;
                self.ledger.record(|r| r.state = WorkflowState::Failed);
                Report::failed(&self.id, err)
            }
            None => {
                info!(workflow = %self.id, "Workflow completed");
                self.ledger.record(|r| r.state = WorkflowState::Succeeded);
                Report::success(&self.id)
            }
        };
        let report = report
            .with_step_reports(reports)
            .with_duration(start.elapsed());

        self.ledger.finish(&report);
        if report.is_failed() {
            // Already undone by the cascade
            self.ledger.mark_rolled_back();
        }
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(record) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        if record.completed.is_empty() {
            return Report::skipped(&self.id);
        }

        info!(workflow = %self.id, steps = record.completed.len(), "Rolling back workflow");

        let mut reports = Vec::with_capacity(record.completed.len());
        let mut first_error: Option<StepError> = None;
        for &index in record.completed.iter().rev() {
            let step = &self.steps[index];
            let rollback = step.rollback(ctx).await;
            if let Some(err) = rollback.error() {
                warn!(workflow = %self.id, step = %step.id(), error = %err, "Rollback failed, continuing");
                if first_error.is_none() {
                    first_error = Some(err.clone());
                }
            }
            reports.push(rollback);
        }

        let report = match first_error {
            Some(err) => Report::failed(&self.id, err),
            None => Report::success(&self.id),
        };
        report.with_step_reports(reports)
    }

    fn children(&self) -> Vec<&dyn Step> {
        self.steps().collect()
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

/// Builder for [`Workflow`]
pub struct WorkflowBuilder {
    id: String,
    steps: Vec<Box<dyn Step>>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append an already boxed step
    pub fn boxed_step(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Append several boxed steps
    pub fn steps(mut self, steps: impl IntoIterator<Item = Box<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn build(self) -> Result<Workflow, BuildError> {
        if self.id.trim().is_empty() {
            return Err(BuildError::EmptyId);
        }
        if self.steps.is_empty() {
            return Err(BuildError::NoSteps(self.id));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let step_id = step.id();
            if step_id.trim().is_empty() {
                return Err(BuildError::EmptyStepId(self.id));
            }
            if !seen.insert(step_id.to_string()) {
                return Err(BuildError::DuplicateStep {
                    workflow: self.id.clone(),
                    step: step_id.to_string(),
                });
            }
        }

        Ok(Workflow {
            id: self.id,
            steps: self.steps,
            ledger: Ledger::new(),
        })
    }
}
