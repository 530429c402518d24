//! Install and configure steps
//!
//! Every [`Installable`] is provisioned by two steps. [`InstallStep`] runs
//! the install phase and [`ConfigureStep`] the configure phase. Both record
//! which sub-actions this run performed in a [`PhaseRecord`], and their
//! rollback only undoes what that record says.

use crate::error::InstallerError;
use crate::installable::Installable;
use async_trait::async_trait;
use nodeforge_workflow::{keys, ErrorKind, Ledger, Lifecycle, Metadata, Report, Step, StepContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sub-actions completed by the current run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseRecord {
    pub downloaded: bool,
    pub extracted: bool,
    pub installed: bool,
    pub cleaned_up: bool,
    pub configured: bool,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Download,
    Extract,
    Install,
    Cleanup,
}

impl Stage {
    const ALL: [Stage; 4] = [Stage::Download, Stage::Extract, Stage::Install, Stage::Cleanup];

    fn kind(self) -> ErrorKind {
        match self {
            Stage::Download => ErrorKind::Download,
            Stage::Extract => ErrorKind::Extraction,
            Stage::Install => ErrorKind::Installation,
            Stage::Cleanup => ErrorKind::Cleanup,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Stage::Download => keys::DOWNLOADED_BY_THIS_STEP,
            Stage::Extract => keys::EXTRACTED_BY_THIS_STEP,
            Stage::Install => keys::INSTALLED_BY_THIS_STEP,
            Stage::Cleanup => keys::CLEANED_UP_BY_THIS_STEP,
        }
    }

    fn mark(self, record: &mut PhaseRecord) {
        match self {
            Stage::Download => record.downloaded = true,
            Stage::Extract => record.extracted = true,
            Stage::Install => record.installed = true,
            Stage::Cleanup => record.cleaned_up = true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Install => "install",
            Stage::Cleanup => "cleanup",
        }
    }
}

/// Install phase of an [`Installable`]
pub struct InstallStep {
    id: String,
    target: Arc<dyn Installable>,
    ledger: Ledger<PhaseRecord>,
}

impl InstallStep {
    /// Step with id `install-<name>`
    pub fn new(target: Arc<dyn Installable>) -> Self {
        Self {
            id: format!("install-{}", target.name()),
            target,
            ledger: Ledger::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// What the most recent run did
    pub fn record(&self) -> PhaseRecord {
        self.ledger.snapshot()
    }

    async fn perform(&self, stage: Stage, ctx: &StepContext) -> crate::Result<()> {
        ctx.check()?;
        match stage {
            Stage::Download => self.target.download(ctx).await,
            Stage::Extract => self.target.extract(ctx).await,
            Stage::Install => self.target.install(ctx).await,
            Stage::Cleanup => self.target.cleanup(ctx).await,
        }
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        match self.target.is_installed(ctx).await {
            Ok(true) => {
                info!(step = %self.id, "Already installed");
                return Report::skipped(&self.id).with_flag(keys::ALREADY_INSTALLED);
            }
            Ok(false) => {}
            Err(e) => {
                return Report::failed(&self.id, e.into_step_error(ErrorKind::Installation));
            }
        }

        let mut done = Metadata::new();
        for stage in Stage::ALL {
            debug!(step = %self.id, stage = stage.name(), "Running stage");
            if let Err(e) = self.perform(stage, ctx).await {
                warn!(step = %self.id, stage = stage.name(), error = %e, "Stage failed");
                return Report::failed(&self.id, e.into_step_error(stage.kind()))
                    .with_all_metadata(done);
            }
            self.ledger.record(|r| stage.mark(r));
            done.insert(stage.flag().to_string(), "true".to_string());
        }

        info!(step = %self.id, "Installed");
        Report::success(&self.id).with_all_metadata(done)
    }
}

#[async_trait]
impl Step for InstallStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("install {}", self.target.name())
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(record) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        if !record.installed {
            debug!(step = %self.id, "Nothing installed by this run");
            return Report::skipped(&self.id);
        }

        info!(step = %self.id, "Uninstalling");
        match self.target.uninstall(ctx).await {
            Ok(()) => Report::success(&self.id),
            Err(e) => Report::failed(&self.id, e.into_step_error(ErrorKind::Installation)),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

/// Configure phase of an [`Installable`]
pub struct ConfigureStep {
    id: String,
    target: Arc<dyn Installable>,
    ledger: Ledger<PhaseRecord>,
}

impl ConfigureStep {
    /// Step with id `configure-<name>`
    pub fn new(target: Arc<dyn Installable>) -> Self {
        Self {
            id: format!("configure-{}", target.name()),
            target,
            ledger: Ledger::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn record(&self) -> PhaseRecord {
        self.ledger.snapshot()
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let fail = |e: InstallerError| {
            Report::failed(&self.id, e.into_step_error(ErrorKind::Configuration))
        };

        match self.target.is_configured(ctx).await {
            Ok(true) => {
                info!(step = %self.id, "Already configured");
                return Report::skipped(&self.id).with_flag(keys::ALREADY_CONFIGURED);
            }
            Ok(false) => {}
            Err(e) => return fail(e),
        }

        if let Err(interrupt) = ctx.check() {
            return fail(interrupt.into());
        }
        if let Err(e) = self.target.configure(ctx).await {
            warn!(step = %self.id, error = %e, "Configuration failed");
            return fail(e);
        }
        self.ledger.record(|r| r.configured = true);

        info!(step = %self.id, "Configured");
        Report::success(&self.id).with_flag(keys::CONFIGURED_BY_THIS_STEP)
    }
}

#[async_trait]
impl Step for ConfigureStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("configure {}", self.target.name())
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(record) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        if !record.configured {
            return Report::skipped(&self.id);
        }

        info!(step = %self.id, "Removing configuration");
        match self.target.remove_configuration(ctx).await {
            Ok(()) => Report::success(&self.id),
            Err(e) => Report::failed(&self.id, e.into_step_error(ErrorKind::Configuration)),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}
