//! The ResourceManager contract

use crate::error::{ResourceError, Result};
use async_trait::async_trait;
use nodeforge_workflow::StepContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

/// A hostPath persistent volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    /// Kubernetes quantity, e.g. `10Gi`
    pub capacity: String,
    pub host_path: PathBuf,
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// A Helm chart release to deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub release: String,
    pub namespace: String,
    /// Chart reference, e.g. `cert-manager` or `jetstack/cert-manager`
    pub chart: String,
    #[serde(default)]
    pub repo: Option<String>,
    pub version: String,
    #[serde(default)]
    pub values: serde_json::Value,
}

/// A deployed Helm release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub chart: String,
    pub chart_version: String,
    pub status: String,
    pub values: serde_json::Value,
}

impl ReleaseInfo {
    /// Helm status of a working release; `failed`, `pending-install` and
    /// the like are not
    pub const DEPLOYED: &'static str = "deployed";

    pub fn is_deployed(&self) -> bool {
        self.status == Self::DEPLOYED
    }
}

/// A workload whose readiness gates a component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessTarget {
    Deployment { namespace: String, name: String },
    DaemonSet { namespace: String, name: String },
    StatefulSet { namespace: String, name: String },
}

impl ReadinessTarget {
    pub fn namespace(&self) -> &str {
        match self {
            ReadinessTarget::Deployment { namespace, .. }
            | ReadinessTarget::DaemonSet { namespace, .. }
            | ReadinessTarget::StatefulSet { namespace, .. } => namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ReadinessTarget::Deployment { name, .. }
            | ReadinessTarget::DaemonSet { name, .. }
            | ReadinessTarget::StatefulSet { name, .. } => name,
        }
    }
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ReadinessTarget::Deployment { .. } => "deployment",
            ReadinessTarget::DaemonSet { .. } => "daemonset",
            ReadinessTarget::StatefulSet { .. } => "statefulset",
        };
        write!(f, "{kind} {}/{}", self.namespace(), self.name())
    }
}

/// Kubernetes and Helm operations used by resource steps
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn namespace_exists(&self, name: &str, ctx: &StepContext) -> Result<bool>;

    async fn create_namespace(&self, name: &str, ctx: &StepContext) -> Result<()>;

    async fn delete_namespace(&self, name: &str, ctx: &StepContext) -> Result<()>;

    async fn volume_exists(&self, name: &str, ctx: &StepContext) -> Result<bool>;

    async fn create_volume(&self, volume: &VolumeSpec, ctx: &StepContext) -> Result<()>;

    async fn delete_volume(&self, name: &str, ctx: &StepContext) -> Result<()>;

    /// The deployed release, if any
    async fn release(
        &self,
        release: &str,
        namespace: &str,
        ctx: &StepContext,
    ) -> Result<Option<ReleaseInfo>>;

    async fn install_chart(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()>;

    async fn upgrade_chart(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()>;

    async fn uninstall_chart(&self, release: &str, namespace: &str, ctx: &StepContext)
        -> Result<()>;

    async fn rollback_chart(
        &self,
        release: &str,
        namespace: &str,
        revision: u32,
        ctx: &StepContext,
    ) -> Result<()>;

    async fn service_annotations(
        &self,
        namespace: &str,
        service: &str,
        ctx: &StepContext,
    ) -> Result<BTreeMap<String, String>>;

    async fn annotate_service(
        &self,
        namespace: &str,
        service: &str,
        annotations: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> Result<()>;

    async fn remove_service_annotations(
        &self,
        namespace: &str,
        service: &str,
        keys: &[String],
        ctx: &StepContext,
    ) -> Result<()>;

    async fn is_ready(&self, target: &ReadinessTarget, ctx: &StepContext) -> Result<bool>;

    /// How often [`ResourceManager::wait_ready`] polls
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(2)
    }

    /// Poll until `target` is ready, `timeout` passes, or `ctx` stops
    async fn wait_ready(
        &self,
        target: &ReadinessTarget,
        timeout: Duration,
        ctx: &StepContext,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready(target, ctx).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ResourceError::Timeout(target.to_string()));
            }
            debug!(target = %target, "Waiting for readiness");
            ctx.sleep(self.poll_interval()).await?;
        }
    }
}

/// Whether two sets of chart values are the same, treating null as `{}`
pub fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    fn normalize(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        }
    }
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_equal_treats_null_as_empty() {
        assert!(values_equal(&json!(null), &json!({})));
        assert!(values_equal(&json!({"a": 1}), &json!({"a": 1})));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 2})));
        assert!(!values_equal(&json!(null), &json!({"a": 1})));
    }

    #[test]
    fn test_readiness_target_display() {
        let target = ReadinessTarget::Deployment {
            namespace: "cert-manager".to_string(),
            name: "cert-manager-webhook".to_string(),
        };
        assert_eq!(target.to_string(), "deployment cert-manager/cert-manager-webhook");
    }

    #[test]
    fn test_readiness_target_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            ready: Vec<ReadinessTarget>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"ready = [{ kind = "daemon_set", namespace = "kube-system", name = "cilium" }]"#,
        )
        .unwrap();
        assert_eq!(parsed.ready[0].name(), "cilium");
        assert!(matches!(parsed.ready[0], ReadinessTarget::DaemonSet { .. }));
    }

    #[test]
    fn test_volume_defaults() {
        let volume: VolumeSpec = toml::from_str(
            r#"
name = "registry-data"
capacity = "20Gi"
host_path = "/var/lib/registry"
"#,
        )
        .unwrap();
        assert_eq!(volume.access_modes, vec!["ReadWriteOnce"]);
        assert!(volume.storage_class.is_none());
    }
}
