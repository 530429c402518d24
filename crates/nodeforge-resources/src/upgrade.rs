//! Chart upgrades
//!
//! [`UpgradeStep`] is the configure phase of a chart-backed component. It
//! compares the deployed release with the requested chart once, at the
//! start of `execute`, and picks one path:
//!
//! ```text
//! deployed, same version + values ─▶ Skipped (AlreadyUpToDate)
//! breaking change                 ─▶ nested migration Workflow
//! anything else                   ─▶ helm upgrade, rollback to PreviousRevision
//! ```

use crate::manager::{values_equal, ChartSpec, ReleaseInfo};
use crate::steps::{ChartInstallStep, ManagerProvider};
use async_trait::async_trait;
use nodeforge_workflow::{
    keys, BuildError, ErrorKind, Ledger, Lifecycle, Report, Step, StepContext, StepError, Workflow,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Major, minor and patch of a chart version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChartVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ChartVersion {
    /// Parse `v1.2.3`, `1.2` or `1.2.3-rc.1`; pre-release and build
    /// suffixes are ignored
    pub fn parse(version: &str) -> Option<Self> {
        let core = version
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor, patch })
    }

    /// Whether moving between `self` and `other` may break compatibility
    ///
    /// Any major change is breaking; below 1.0 a minor change is too.
    pub fn is_breaking(&self, other: &ChartVersion) -> bool {
        if self.major != other.major {
            return true;
        }
        self.major == 0 && self.minor != other.minor
    }
}

impl fmt::Display for ChartVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether two chart version strings name the same chart release
///
/// A leading `v` is not significant (`helm list` reports `v1.14.4` for
/// `--version 1.14.4`); `1.2` equals `1.2.0`. Versions with a pre-release
/// or build suffix must match exactly.
pub fn same_version(a: &str, b: &str) -> bool {
    let strip = |s: &str| {
        let s = s.trim();
        s.strip_prefix('v').unwrap_or(s).to_string()
    };
    let (a, b) = (strip(a), strip(b));
    if a == b {
        return true;
    }
    let plain = |s: &str| !s.contains(['-', '+']);
    plain(&a)
        && plain(&b)
        && matches!(
            (ChartVersion::parse(&a), ChartVersion::parse(&b)),
            (Some(x), Some(y)) if x == y
        )
}

/// Split a Helm `chart` column such as `cert-manager-v1.14.4` into name and
/// version
pub fn split_chart_version(chart: &str) -> Option<(&str, &str)> {
    // The leftmost dash followed by a full x.y.z version; later dashes may
    // belong to a pre-release suffix
    chart
        .match_indices('-')
        .map(|(i, _)| i)
        .find(|&i| is_full_version(&chart[i + 1..]))
        .map(|i| (&chart[..i], &chart[i + 1..]))
}

fn is_full_version(s: &str) -> bool {
    let core = s.trim_start_matches('v').split(['-', '+']).next().unwrap_or("");
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Decides when an upgrade needs a migration, and builds it
pub trait MigrationPlan: Send + Sync {
    fn requires_migration(&self, deployed: &ReleaseInfo, requested: &ChartSpec) -> bool;

    fn build(
        &self,
        deployed: &ReleaseInfo,
        requested: &ChartSpec,
        manager: ManagerProvider,
    ) -> Result<Workflow, BuildError>;
}

/// Migration by uninstalling the deployed release and installing fresh
///
/// Required on a breaking version change, or when the deployed version is
/// below the configured threshold and the requested one is not.
#[derive(Debug, Clone, Default)]
pub struct ReinstallMigration {
    threshold: Option<ChartVersion>,
}

impl ReinstallMigration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a migration when crossing `version` upwards
    pub fn with_threshold(mut self, version: ChartVersion) -> Self {
        self.threshold = Some(version);
        self
    }
}

impl MigrationPlan for ReinstallMigration {
    fn requires_migration(&self, deployed: &ReleaseInfo, requested: &ChartSpec) -> bool {
        let (Some(from), Some(to)) = (
            ChartVersion::parse(&deployed.chart_version),
            ChartVersion::parse(&requested.version),
        ) else {
            return false;
        };
        if from.is_breaking(&to) {
            return true;
        }
        match self.threshold {
            Some(threshold) => from < threshold && to >= threshold,
            None => false,
        }
    }

    fn build(
        &self,
        deployed: &ReleaseInfo,
        requested: &ChartSpec,
        manager: ManagerProvider,
    ) -> Result<Workflow, BuildError> {
        let previous = ChartSpec {
            version: deployed.chart_version.clone(),
            values: deployed.values.clone(),
            ..requested.clone()
        };
        Workflow::builder(format!("{}-migration", requested.release))
            .step(UninstallReleaseStep::new(
                format!("{}-uninstall-previous", requested.release),
                previous,
                manager.clone(),
            ))
            .step(ChartInstallStep::new(
                format!("{}-reinstall", requested.release),
                requested.clone(),
                manager,
            ))
            .build()
    }
}

/// Removes a deployed release; rollback reinstalls it as it was
pub struct UninstallReleaseStep {
    id: String,
    previous: ChartSpec,
    manager: ManagerProvider,
    ledger: Ledger<bool>,
}

impl UninstallReleaseStep {
    pub fn new(id: impl Into<String>, previous: ChartSpec, manager: ManagerProvider) -> Self {
        Self {
            id: id.into(),
            previous,
            manager,
            ledger: Ledger::new(),
        }
    }
}

#[async_trait]
impl Step for UninstallReleaseStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("uninstall {} {}", self.previous.release, self.previous.version)
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = match self.manager.get().await {
            Ok(manager) => {
                info!(step = %self.id, release = %self.previous.release, "Uninstalling release for migration");
                match manager
                    .uninstall_chart(&self.previous.release, &self.previous.namespace, ctx)
                    .await
                {
                    Ok(()) => {
                        self.ledger.record(|removed| *removed = true);
                        Report::success(&self.id)
                    }
                    Err(e) => Report::failed(&self.id, e.into_step_error(ErrorKind::Configuration)),
                }
            }
            Err(err) => Report::failed(&self.id, err),
        };
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        if self.ledger.take_for_rollback() != Some(true) {
            return Report::skipped(&self.id);
        }
        let manager = match self.manager.get().await {
            Ok(manager) => manager,
            Err(err) => return Report::failed(&self.id, err),
        };

        info!(step = %self.id, version = %self.previous.version, "Reinstalling previous release");
        match manager.install_chart(&self.previous, ctx).await {
            Ok(()) => Report::success(&self.id),
            Err(e) => Report::failed(&self.id, e.into_step_error(ErrorKind::Configuration)),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

#[derive(Debug, Clone, Default)]
enum UpgradeAction {
    #[default]
    None,
    Direct {
        previous_revision: u32,
    },
    Migrated(Arc<Workflow>),
    MigrationFailed,
}

/// Brings a deployed release to the requested chart version and values
pub struct UpgradeStep {
    id: String,
    chart: ChartSpec,
    manager: ManagerProvider,
    plan: Arc<dyn MigrationPlan>,
    ledger: Ledger<UpgradeAction>,
}

impl UpgradeStep {
    pub fn new(id: impl Into<String>, chart: ChartSpec, manager: ManagerProvider) -> Self {
        Self {
            id: id.into(),
            chart,
            manager,
            plan: Arc::new(ReinstallMigration::new()),
            ledger: Ledger::new(),
        }
    }

    pub fn with_plan(mut self, plan: Arc<dyn MigrationPlan>) -> Self {
        self.plan = plan;
        self
    }

    fn fail(&self, err: StepError) -> Report {
        Report::failed(&self.id, err)
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let manager = match self.manager.get().await {
            Ok(manager) => manager,
            Err(err) => return self.fail(err),
        };

        let deployed = match manager
            .release(&self.chart.release, &self.chart.namespace, ctx)
            .await
        {
            Ok(Some(deployed)) => deployed,
            Ok(None) => {
                return self.fail(StepError::new(
                    ErrorKind::Configuration,
                    format!(
                        "release {}/{} is not deployed",
                        self.chart.namespace, self.chart.release
                    ),
                ))
            }
            Err(e) => return self.fail(e.into_step_error(ErrorKind::Configuration)),
        };

        if !deployed.is_deployed() {
            warn!(step = %self.id, status = %deployed.status, "Release is not deployed");
        } else if same_version(&deployed.chart_version, &self.chart.version)
            && values_equal(&deployed.values, &self.chart.values)
        {
            info!(step = %self.id, version = %deployed.chart_version, "Release up to date");
            return Report::skipped(&self.id).with_flag(keys::ALREADY_UP_TO_DATE);
        }

        if self.plan.requires_migration(&deployed, &self.chart) {
            return self.migrate(&deployed, ctx).await;
        }

        info!(
            step = %self.id,
            from = %deployed.chart_version,
            to = %self.chart.version,
            revision = deployed.revision,
            "Upgrading release"
        );
        if let Err(e) = manager.upgrade_chart(&self.chart, ctx).await {
            warn!(step = %self.id, error = %e, "Upgrade failed");
            return self.fail(e.into_step_error(ErrorKind::Configuration));
        }
        self.ledger.record(|action| {
            *action = UpgradeAction::Direct {
                previous_revision: deployed.revision,
            }
        });
        Report::success(&self.id)
            .with_flag(keys::UPGRADED_BY_THIS_STEP)
            .with_metadata(keys::PREVIOUS_REVISION, deployed.revision.to_string())
    }

    async fn migrate(&self, deployed: &ReleaseInfo, ctx: &StepContext) -> Report {
        info!(
            step = %self.id,
            from = %deployed.chart_version,
            to = %self.chart.version,
            "Breaking change, migrating release"
        );
        let migration = match self.plan.build(deployed, &self.chart, self.manager.clone()) {
            Ok(workflow) => Arc::new(workflow),
            Err(e) => {
                return self.fail(StepError::new(ErrorKind::Internal, e.to_string()).caused_by(e))
            }
        };

        let nested = migration.execute(ctx).await;
        match nested.error().cloned() {
            Some(err) => {
                // The migration has rolled itself back
                self.ledger
                    .record(|action| *action = UpgradeAction::MigrationFailed);
                self.fail(err).with_step_reports(vec![nested])
            }
            None => {
                self.ledger
                    .record(|action| *action = UpgradeAction::Migrated(migration));
                Report::success(&self.id)
                    .with_flag(keys::MIGRATED_BY_THIS_STEP)
                    .with_metadata(keys::PREVIOUS_REVISION, deployed.revision.to_string())
                    .with_step_reports(vec![nested])
            }
        }
    }
}

#[async_trait]
impl Step for UpgradeStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!(
            "upgrade {} to {} {}",
            self.chart.release, self.chart.chart, self.chart.version
        )
    }

    async fn prepare(&self, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
        self.manager.get().await?;
        Ok(ctx)
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(action) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };

        match action {
            UpgradeAction::None | UpgradeAction::MigrationFailed => {
                debug!(step = %self.id, "Nothing to roll back");
                Report::skipped(&self.id)
            }
            UpgradeAction::Direct { previous_revision } => {
                let manager = match self.manager.get().await {
                    Ok(manager) => manager,
                    Err(err) => return self.fail(err),
                };
                info!(step = %self.id, revision = previous_revision, "Restoring previous revision");
                match manager
                    .rollback_chart(
                        &self.chart.release,
                        &self.chart.namespace,
                        previous_revision,
                        ctx,
                    )
                    .await
                {
                    Ok(()) => Report::success(&self.id),
                    Err(e) => self.fail(e.into_step_error(ErrorKind::Configuration)),
                }
            }
            UpgradeAction::Migrated(migration) => {
                let nested = migration.rollback(ctx).await;
                match nested.error().cloned() {
                    Some(err) => self.fail(err).with_step_reports(vec![nested]),
                    None => Report::success(&self.id).with_step_reports(vec![nested]),
                }
            }
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}
