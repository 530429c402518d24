//! Resource workflow steps
//!
//! Each step records what the current run created in a [`StateBag`] and
//! its rollback removes exactly that. Steps share one
//! [`ResourceManager`] through a [`Provider`]; the manager is built in
//! `prepare`, so a cluster that cannot be reached fails the first step
//! that needs it.

use crate::manager::{ChartSpec, ReadinessTarget, ResourceManager, VolumeSpec};
use async_trait::async_trait;
use nodeforge_workflow::{
    keys, ErrorKind, Ledger, Lifecycle, Provider, Report, StateBag, Step, StepContext, StepError,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Shared handle to the cluster
pub type ManagerProvider = Provider<dyn ResourceManager>;

async fn manager(provider: &ManagerProvider, id: &str) -> Result<Arc<dyn ResourceManager>, Report> {
    provider.get().await.map_err(|err| Report::failed(id, err))
}

async fn warm(provider: &ManagerProvider, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
    provider.get().await?;
    Ok(ctx)
}

/// Creates host directories backing the component's volumes
///
/// The directories may hold data from earlier runs, so rollback never
/// removes them.
pub struct StorageDirsStep {
    id: String,
    dirs: Vec<PathBuf>,
    ledger: Ledger<StateBag>,
}

impl StorageDirsStep {
    pub fn new(id: impl Into<String>, dirs: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dirs,
            ledger: Ledger::new(),
        }
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let mut missing = Vec::new();
        for dir in &self.dirs {
            match fs::try_exists(dir).await {
                Ok(true) => {}
                Ok(false) => missing.push(dir),
                Err(e) => {
                    let err = StepError::new(
                        ErrorKind::Installation,
                        format!("cannot inspect {}: {e}", dir.display()),
                    )
                    .caused_by(e);
                    return Report::failed(&self.id, err);
                }
            }
        }
        if missing.is_empty() {
            return Report::skipped(&self.id).with_flag(keys::ALREADY_EXISTS);
        }

        for dir in missing {
            if let Err(interrupt) = ctx.check() {
                return Report::failed(&self.id, interrupt.into());
            }
            if let Err(e) = fs::create_dir_all(dir).await {
                let err = StepError::new(
                    ErrorKind::Installation,
                    format!("cannot create {}: {e}", dir.display()),
                )
                .caused_by(e);
                return Report::failed(&self.id, err);
            }
            debug!(step = %self.id, path = %dir.display(), "Created storage directory");
        }
        Report::success(&self.id)
    }
}

#[async_trait]
impl Step for StorageDirsStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("create {} storage directories", self.dirs.len())
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, _ctx: &StepContext) -> Report {
        self.ledger.take_for_rollback();
        debug!(step = %self.id, "Storage directories are kept");
        Report::skipped(&self.id)
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

/// Ensures a namespace exists
pub struct NamespaceStep {
    id: String,
    namespace: String,
    manager: ManagerProvider,
    ledger: Ledger<StateBag>,
}

impl NamespaceStep {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, manager: ManagerProvider) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            manager,
            ledger: Ledger::new(),
        }
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };
        let fail = |e: crate::ResourceError| {
            Report::failed(&self.id, e.into_step_error(ErrorKind::Installation))
        };

        match manager.namespace_exists(&self.namespace, ctx).await {
            Ok(true) => {
                info!(step = %self.id, namespace = %self.namespace, "Namespace already exists");
                return Report::skipped(&self.id).with_flag(keys::ALREADY_EXISTS);
            }
            Ok(false) => {}
            Err(e) => return fail(e),
        }

        if let Err(e) = manager.create_namespace(&self.namespace, ctx).await {
            return fail(e);
        }
        self.ledger
            .record(|bag| bag.set(keys::NAMESPACE_CREATED_BY_THIS_STEP, true));
        info!(step = %self.id, namespace = %self.namespace, "Created namespace");
        Report::success(&self.id).with_flag(keys::NAMESPACE_CREATED_BY_THIS_STEP)
    }
}

#[async_trait]
impl Step for NamespaceStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("ensure namespace {}", self.namespace)
    }

    async fn prepare(&self, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
        warm(&self.manager, ctx).await
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(bag) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        if !bag.flag(keys::NAMESPACE_CREATED_BY_THIS_STEP) {
            return Report::skipped(&self.id);
        }
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };

        info!(step = %self.id, namespace = %self.namespace, "Deleting namespace");
        match manager.delete_namespace(&self.namespace, ctx).await {
            Ok(()) => Report::success(&self.id),
            Err(e) => Report::failed(&self.id, e.into_step_error(ErrorKind::Installation)),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

/// Creates the persistent volumes that do not exist yet
pub struct VolumesStep {
    id: String,
    volumes: Vec<VolumeSpec>,
    manager: ManagerProvider,
    ledger: Ledger<StateBag>,
}

impl VolumesStep {
    pub fn new(id: impl Into<String>, volumes: Vec<VolumeSpec>, manager: ManagerProvider) -> Self {
        Self {
            id: id.into(),
            volumes,
            manager,
            ledger: Ledger::new(),
        }
    }

    /// Volumes created by the most recent run
    pub fn created(&self) -> Vec<String> {
        self.ledger
            .snapshot()
            .list(keys::VOLUMES_CREATED_BY_THIS_STEP)
            .to_vec()
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };

        let mut created = Vec::new();
        let summary = |created: &[String]| created.join(",");
        for volume in &self.volumes {
            let result = match manager.volume_exists(&volume.name, ctx).await {
                Ok(true) => {
                    debug!(step = %self.id, volume = %volume.name, "Volume already exists");
                    continue;
                }
                Ok(false) => manager.create_volume(volume, ctx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(step = %self.id, volume = %volume.name, error = %e, "Volume creation failed");
                let report = Report::failed(&self.id, e.into_step_error(ErrorKind::Installation));
                return if created.is_empty() {
                    report
                } else {
                    report.with_metadata(keys::VOLUMES_CREATED_BY_THIS_STEP, summary(&created))
                };
            }
            self.ledger
                .record(|bag| bag.push(keys::VOLUMES_CREATED_BY_THIS_STEP, volume.name.clone()));
            info!(step = %self.id, volume = %volume.name, "Created persistent volume");
            created.push(volume.name.clone());
        }

        if created.is_empty() {
            return Report::skipped(&self.id).with_flag(keys::ALREADY_EXISTS);
        }
        Report::success(&self.id).with_metadata(keys::VOLUMES_CREATED_BY_THIS_STEP, summary(&created))
    }
}

#[async_trait]
impl Step for VolumesStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("ensure {} persistent volumes", self.volumes.len())
    }

    async fn prepare(&self, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
        warm(&self.manager, ctx).await
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(bag) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        let created = bag.list(keys::VOLUMES_CREATED_BY_THIS_STEP);
        if created.is_empty() {
            return Report::skipped(&self.id);
        }
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };

        let mut first_error = None;
        for name in created.iter().rev() {
            info!(step = %self.id, volume = %name, "Deleting persistent volume");
            if let Err(e) = manager.delete_volume(name, ctx).await {
                warn!(step = %self.id, volume = %name, error = %e, "Volume deletion failed");
                first_error.get_or_insert(e.into_step_error(ErrorKind::Installation));
            }
        }
        match first_error {
            Some(err) => Report::failed(&self.id, err),
            None => Report::success(&self.id),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

/// Installs a chart release unless one is already deployed
///
/// A deployed release of any version counts as installed; bringing it to
/// the requested version is the upgrade step's job. A release stuck in any
/// other Helm status (`failed`, `pending-install`) is uninstalled and
/// installed again.
pub struct ChartInstallStep {
    id: String,
    chart: ChartSpec,
    manager: ManagerProvider,
    ledger: Ledger<StateBag>,
}

impl ChartInstallStep {
    pub fn new(id: impl Into<String>, chart: ChartSpec, manager: ManagerProvider) -> Self {
        Self {
            id: id.into(),
            chart,
            manager,
            ledger: Ledger::new(),
        }
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };
        let fail = |e: crate::ResourceError| {
            Report::failed(&self.id, e.into_step_error(ErrorKind::Installation))
        };

        let mut replaced = None;
        match manager
            .release(&self.chart.release, &self.chart.namespace, ctx)
            .await
        {
            Ok(Some(deployed)) if deployed.is_deployed() => {
                info!(
                    step = %self.id,
                    release = %deployed.name,
                    version = %deployed.chart_version,
                    "Release already deployed"
                );
                return Report::skipped(&self.id).with_flag(keys::ALREADY_EXISTS);
            }
            Ok(Some(broken)) => {
                warn!(
                    step = %self.id,
                    release = %broken.name,
                    status = %broken.status,
                    "Release is not deployed, reinstalling"
                );
                if let Err(e) = manager
                    .uninstall_chart(&self.chart.release, &self.chart.namespace, ctx)
                    .await
                {
                    return fail(e);
                }
                replaced = Some(broken.status);
            }
            Ok(None) => {}
            Err(e) => return fail(e),
        }

        info!(
            step = %self.id,
            release = %self.chart.release,
            chart = %self.chart.chart,
            version = %self.chart.version,
            "Installing chart"
        );
        if let Err(e) = manager.install_chart(&self.chart, ctx).await {
            return fail(e);
        }
        self.ledger
            .record(|bag| bag.set(keys::CHART_INSTALLED_BY_THIS_STEP, true));
        let report = Report::success(&self.id).with_flag(keys::CHART_INSTALLED_BY_THIS_STEP);
        match replaced {
            Some(status) => report.with_metadata(keys::REPLACED_RELEASE_STATUS, status),
            None => report,
        }
    }
}

#[async_trait]
impl Step for ChartInstallStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("install chart {} {}", self.chart.chart, self.chart.version)
    }

    async fn prepare(&self, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
        warm(&self.manager, ctx).await
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(bag) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        if !bag.flag(keys::CHART_INSTALLED_BY_THIS_STEP) {
            return Report::skipped(&self.id);
        }
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };

        info!(step = %self.id, release = %self.chart.release, "Uninstalling chart");
        match manager
            .uninstall_chart(&self.chart.release, &self.chart.namespace, ctx)
            .await
        {
            Ok(()) => Report::success(&self.id),
            Err(e) => Report::failed(&self.id, e.into_step_error(ErrorKind::Installation)),
        }
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

const PREVIOUS_ANNOTATIONS: &str = "previous-annotations";

/// Applies annotations to a service the chart created
///
/// Rollback removes keys this run added and restores values it overwrote.
pub struct AnnotateServiceStep {
    id: String,
    namespace: String,
    service: String,
    annotations: BTreeMap<String, String>,
    manager: ManagerProvider,
    ledger: Ledger<StateBag>,
}

impl AnnotateServiceStep {
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        service: impl Into<String>,
        annotations: BTreeMap<String, String>,
        manager: ManagerProvider,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            service: service.into(),
            annotations,
            manager,
            ledger: Ledger::new(),
        }
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };
        let fail = |e: crate::ResourceError| {
            Report::failed(&self.id, e.into_step_error(ErrorKind::Installation))
        };

        let current = match manager
            .service_annotations(&self.namespace, &self.service, ctx)
            .await
        {
            Ok(current) => current,
            Err(e) => return fail(e),
        };

        let changes: BTreeMap<String, String> = self
            .annotations
            .iter()
            .filter(|(k, v)| current.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if changes.is_empty() {
            return Report::skipped(&self.id).with_flag(keys::ALREADY_EXISTS);
        }

        if let Err(e) = manager
            .annotate_service(&self.namespace, &self.service, &changes, ctx)
            .await
        {
            return fail(e);
        }

        let added: Vec<String> = changes
            .keys()
            .filter(|k| !current.contains_key(*k))
            .cloned()
            .collect();
        let overwritten: BTreeMap<String, String> = changes
            .keys()
            .filter_map(|k| current.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        self.ledger.record(|bag| {
            bag.set(keys::SERVICE_ANNOTATED_BY_THIS_STEP, added);
            bag.set_opaque(PREVIOUS_ANNOTATIONS, overwritten);
        });

        info!(
            step = %self.id,
            service = %format!("{}/{}", self.namespace, self.service),
            count = changes.len(),
            "Annotated service"
        );
        Report::success(&self.id).with_flag(keys::SERVICE_ANNOTATED_BY_THIS_STEP)
    }
}

#[async_trait]
impl Step for AnnotateServiceStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("annotate service {}/{}", self.namespace, self.service)
    }

    async fn prepare(&self, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
        warm(&self.manager, ctx).await
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, ctx: &StepContext) -> Report {
        let Some(bag) = self.ledger.take_for_rollback() else {
            return Report::skipped(&self.id);
        };
        if !bag.contains(keys::SERVICE_ANNOTATED_BY_THIS_STEP) {
            return Report::skipped(&self.id);
        }
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };
        let fail = |e: crate::ResourceError| {
            Report::failed(&self.id, e.into_step_error(ErrorKind::Installation))
        };

        let added = bag.list(keys::SERVICE_ANNOTATED_BY_THIS_STEP);
        if !added.is_empty() {
            if let Err(e) = manager
                .remove_service_annotations(&self.namespace, &self.service, added, ctx)
                .await
            {
                return fail(e);
            }
        }
        if let Some(previous) = bag.opaque::<BTreeMap<String, String>>(PREVIOUS_ANNOTATIONS) {
            if !previous.is_empty() {
                if let Err(e) = manager
                    .annotate_service(&self.namespace, &self.service, &previous, ctx)
                    .await
                {
                    return fail(e);
                }
            }
        }
        info!(step = %self.id, "Reverted service annotations");
        Report::success(&self.id)
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}

/// Waits for workloads to report ready
pub struct WaitReadyStep {
    id: String,
    targets: Vec<ReadinessTarget>,
    timeout: Duration,
    manager: ManagerProvider,
    ledger: Ledger<StateBag>,
}

impl WaitReadyStep {
    pub fn new(
        id: impl Into<String>,
        targets: Vec<ReadinessTarget>,
        timeout: Duration,
        manager: ManagerProvider,
    ) -> Self {
        Self {
            id: id.into(),
            targets,
            timeout,
            manager,
            ledger: Ledger::new(),
        }
    }

    async fn run(&self, ctx: &StepContext) -> Report {
        let manager = match manager(&self.manager, &self.id).await {
            Ok(m) => m,
            Err(report) => return report,
        };
        // A context deadline tighter than our own wins
        let timeout = ctx
            .remaining()
            .map_or(self.timeout, |left| left.min(self.timeout));

        for target in &self.targets {
            info!(step = %self.id, target = %target, timeout_secs = timeout.as_secs(), "Waiting for readiness");
            if let Err(e) = manager.wait_ready(target, timeout, ctx).await {
                warn!(step = %self.id, target = %target, error = %e, "Not ready");
                return Report::failed(&self.id, e.into_step_error(ErrorKind::Installation));
            }
        }
        Report::success(&self.id).with_flag(keys::READY)
    }
}

#[async_trait]
impl Step for WaitReadyStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        let targets: Vec<String> = self.targets.iter().map(ToString::to_string).collect();
        format!("wait for {}", targets.join(", "))
    }

    async fn prepare(&self, ctx: StepContext) -> nodeforge_workflow::Result<StepContext> {
        warm(&self.manager, ctx).await
    }

    async fn execute(&self, ctx: &StepContext) -> Report {
        self.ledger.begin();
        let report = self.run(ctx).await;
        self.ledger.finish(&report);
        report
    }

    async fn rollback(&self, _ctx: &StepContext) -> Report {
        self.ledger.take_for_rollback();
        Report::skipped(&self.id)
    }

    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(self.ledger.lifecycle())
    }
}
