//! Chart-backed components
//!
//! A [`ChartComponent`] is deserialized from the node file and turned into
//! two phases: [`ChartComponent::install_workflow`] and
//! [`ChartComponent::upgrade_step`].

use crate::error::ResourceError;
use crate::manager::{ChartSpec, ReadinessTarget, VolumeSpec};
use crate::steps::{
    AnnotateServiceStep, ChartInstallStep, ManagerProvider, NamespaceStep, StorageDirsStep,
    VolumesStep, WaitReadyStep,
};
use crate::upgrade::{ChartVersion, ReinstallMigration, UpgradeStep};
use nodeforge_workflow::{BuildError, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    300
}

fn empty_values() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Annotations applied to a service created by the chart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnotations {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

/// A component deployed as a Helm chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartComponent {
    pub name: String,
    pub namespace: String,
    /// Release name, defaults to `name`
    #[serde(default)]
    pub release: Option<String>,
    pub chart: String,
    #[serde(default)]
    pub repo: Option<String>,
    pub version: String,
    #[serde(default = "empty_values")]
    pub values: serde_json::Value,
    #[serde(default)]
    pub storage_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub service: Option<ServiceAnnotations>,
    #[serde(default)]
    pub readiness: Vec<ReadinessTarget>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Deployed versions below this are migrated rather than upgraded
    #[serde(default)]
    pub migrate_below: Option<String>,
}

impl ChartComponent {
    pub fn release_name(&self) -> &str {
        self.release.as_deref().unwrap_or(&self.name)
    }

    pub fn chart_spec(&self) -> ChartSpec {
        ChartSpec {
            release: self.release_name().to_string(),
            namespace: self.namespace.clone(),
            chart: self.chart.clone(),
            repo: self.repo.clone(),
            version: self.version.clone(),
            values: self.values.clone(),
        }
    }

    fn step_id(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.name)
    }

    /// Storage, namespace, volumes, chart, annotations, readiness
    ///
    /// Steps with nothing configured are left out; namespace and chart are
    /// always present.
    pub fn install_workflow(&self, manager: &ManagerProvider) -> Result<Workflow, BuildError> {
        let mut builder = Workflow::builder(self.step_id("resources"));
        if !self.storage_dirs.is_empty() {
            builder = builder.step(StorageDirsStep::new(
                self.step_id("storage"),
                self.storage_dirs.clone(),
            ));
        }
        builder = builder.step(NamespaceStep::new(
            self.step_id("namespace"),
            &self.namespace,
            manager.clone(),
        ));
        if !self.volumes.is_empty() {
            builder = builder.step(VolumesStep::new(
                self.step_id("volumes"),
                self.volumes.clone(),
                manager.clone(),
            ));
        }
        builder = builder.step(ChartInstallStep::new(
            self.step_id("chart"),
            self.chart_spec(),
            manager.clone(),
        ));
        if let Some(service) = &self.service {
            builder = builder.step(AnnotateServiceStep::new(
                self.step_id("annotate"),
                &self.namespace,
                &service.name,
                service.annotations.clone(),
                manager.clone(),
            ));
        }
        if !self.readiness.is_empty() {
            builder = builder.step(WaitReadyStep::new(
                self.step_id("ready"),
                self.readiness.clone(),
                Duration::from_secs(self.timeout_secs),
                manager.clone(),
            ));
        }
        builder.build()
    }

    /// Reject settings that would otherwise be ignored
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |reason: String| ResourceError::InvalidComponent {
            component: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if let Some(threshold) = &self.migrate_below {
            if ChartVersion::parse(threshold).is_none() {
                return Err(invalid(format!(
                    "migrate_below '{threshold}' is not a version"
                )));
            }
        }
        Ok(())
    }

    /// Upgrade step; `migrate_below` is expected to have passed [`validate`](Self::validate)
    pub fn upgrade_step(&self, manager: &ManagerProvider) -> UpgradeStep {
        let mut plan = ReinstallMigration::new();
        if let Some(threshold) = self.migrate_below.as_deref().and_then(ChartVersion::parse) {
            plan = plan.with_threshold(threshold);
        }
        UpgradeStep::new(self.step_id("upgrade"), self.chart_spec(), manager.clone())
            .with_plan(Arc::new(plan))
    }
}
