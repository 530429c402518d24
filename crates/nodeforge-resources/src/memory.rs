//! In-memory ResourceManager
//!
//! Keeps a model of a cluster in process so resource workflows can be
//! exercised without Kubernetes. Releases keep their revision history and
//! rollbacks behave like `helm rollback`: the old revision is re-deployed as
//! a new one.

use crate::error::{ResourceError, Result};
use crate::manager::{ChartSpec, ReadinessTarget, ReleaseInfo, ResourceManager, VolumeSpec};
use async_trait::async_trait;
use nodeforge_workflow::StepContext;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn split_chart_name(chart: &str) -> &str {
    chart.rsplit('/').next().unwrap_or(chart)
}

#[derive(Debug, Default)]
struct Cluster {
    namespaces: BTreeSet<String>,
    volumes: BTreeMap<String, VolumeSpec>,
    releases: BTreeMap<Key, Vec<ReleaseInfo>>,
    services: BTreeMap<Key, BTreeMap<String, String>>,
    not_ready: BTreeSet<ReadinessTarget>,
    failures: BTreeSet<String>,
    calls: Vec<String>,
}

impl Cluster {
    /// Log `call` and fail if its operation was scripted to fail
    fn enter(&mut self, op: &str, call: String) -> Result<()> {
        let scripted = self.failures.contains(op) || self.failures.contains(&call);
        self.calls.push(call.clone());
        if scripted {
            return Err(ResourceError::Failed(format!("{call} failed")));
        }
        Ok(())
    }
}

/// [`ResourceManager`] backed by an in-process cluster model
#[derive(Debug, Default)]
pub struct MemoryResourceManager {
    cluster: Mutex<Cluster>,
}

impl MemoryResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Cluster> {
        self.cluster.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_namespace(self, name: &str) -> Self {
        self.lock().namespaces.insert(name.to_string());
        self
    }

    pub fn with_volume(self, volume: VolumeSpec) -> Self {
        self.lock().volumes.insert(volume.name.clone(), volume);
        self
    }

    /// A release already deployed at revision 1
    pub fn with_release(self, chart: &ChartSpec) -> Self {
        {
            let mut cluster = self.lock();
            cluster.namespaces.insert(chart.namespace.clone());
            cluster.releases.insert(
                key(&chart.namespace, &chart.release),
                vec![release_info(chart, 1)],
            );
        }
        self
    }

    /// Set the Helm status of a release's latest revision, e.g. `failed`
    pub fn with_release_status(self, release: &str, namespace: &str, status: &str) -> Self {
        if let Some(latest) = self
            .lock()
            .releases
            .get_mut(&key(namespace, release))
            .and_then(|history| history.last_mut())
        {
            latest.status = status.to_string();
        }
        self
    }

    pub fn with_service(self, namespace: &str, service: &str) -> Self {
        self.lock()
            .services
            .entry(key(namespace, service))
            .or_default();
        self
    }

    pub fn with_service_annotation(self, namespace: &str, service: &str, k: &str, v: &str) -> Self {
        self.lock()
            .services
            .entry(key(namespace, service))
            .or_default()
            .insert(k.to_string(), v.to_string());
        self
    }

    /// `target` never becomes ready
    pub fn never_ready(self, target: ReadinessTarget) -> Self {
        self.lock().not_ready.insert(target);
        self
    }

    /// Fail every call of `op` (e.g. `install_chart`), or one exact call
    /// (e.g. `create_volume:data-1`)
    pub fn fail_on(self, op: &str) -> Self {
        self.lock().failures.insert(op.to_string());
        self
    }

    /// Calls made so far, as `op:arg`; chart installs are
    /// `install_chart:release:version`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains_key(name)
    }

    /// Latest revision of a release
    pub fn deployed(&self, release: &str, namespace: &str) -> Option<ReleaseInfo> {
        self.lock()
            .releases
            .get(&key(namespace, release))
            .and_then(|history| history.last().cloned())
    }

    pub fn annotations(&self, namespace: &str, service: &str) -> BTreeMap<String, String> {
        self.lock()
            .services
            .get(&key(namespace, service))
            .cloned()
            .unwrap_or_default()
    }
}

fn release_info(chart: &ChartSpec, revision: u32) -> ReleaseInfo {
    ReleaseInfo {
        name: chart.release.clone(),
        namespace: chart.namespace.clone(),
        revision,
        chart: split_chart_name(&chart.chart).to_string(),
        chart_version: chart.version.clone(),
        status: ReleaseInfo::DEPLOYED.to_string(),
        values: chart.values.clone(),
    }
}

fn service_not_found(namespace: &str, service: &str) -> ResourceError {
    ResourceError::NotFound {
        kind: "service",
        name: format!("{namespace}/{service}"),
    }
}

fn release_not_found(namespace: &str, release: &str) -> ResourceError {
    ResourceError::NotFound {
        kind: "release",
        name: format!("{namespace}/{release}"),
    }
}

#[async_trait]
impl ResourceManager for MemoryResourceManager {
    async fn namespace_exists(&self, name: &str, ctx: &StepContext) -> Result<bool> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("namespace_exists", format!("namespace_exists:{name}"))?;
        Ok(cluster.namespaces.contains(name))
    }

    async fn create_namespace(&self, name: &str, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("create_namespace", format!("create_namespace:{name}"))?;
        cluster.namespaces.insert(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("delete_namespace", format!("delete_namespace:{name}"))?;
        cluster.namespaces.remove(name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str, ctx: &StepContext) -> Result<bool> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("volume_exists", format!("volume_exists:{name}"))?;
        Ok(cluster.volumes.contains_key(name))
    }

    async fn create_volume(&self, volume: &VolumeSpec, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("create_volume", format!("create_volume:{}", volume.name))?;
        cluster.volumes.insert(volume.name.clone(), volume.clone());
        Ok(())
    }

    async fn delete_volume(&self, name: &str, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("delete_volume", format!("delete_volume:{name}"))?;
        cluster.volumes.remove(name);
        Ok(())
    }

    async fn release(
        &self,
        release: &str,
        namespace: &str,
        ctx: &StepContext,
    ) -> Result<Option<ReleaseInfo>> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("release", format!("release:{release}"))?;
        Ok(cluster
            .releases
            .get(&key(namespace, release))
            .and_then(|history| history.last().cloned()))
    }

    async fn install_chart(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter(
            "install_chart",
            format!("install_chart:{}:{}", chart.release, chart.version),
        )?;
        let history = cluster
            .releases
            .entry(key(&chart.namespace, &chart.release))
            .or_default();
        if !history.is_empty() {
            return Err(ResourceError::Failed(format!(
                "cannot re-use a name that is still in use: {}",
                chart.release
            )));
        }
        history.push(release_info(chart, 1));
        Ok(())
    }

    async fn upgrade_chart(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("upgrade_chart", format!("upgrade_chart:{}", chart.release))?;
        let history = cluster
            .releases
            .get_mut(&key(&chart.namespace, &chart.release))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| release_not_found(&chart.namespace, &chart.release))?;
        let revision = history.last().map_or(1, |r| r.revision + 1);
        history.push(release_info(chart, revision));
        Ok(())
    }

    async fn uninstall_chart(&self, release: &str, namespace: &str, ctx: &StepContext) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("uninstall_chart", format!("uninstall_chart:{release}"))?;
        cluster.releases.remove(&key(namespace, release));
        Ok(())
    }

    async fn rollback_chart(
        &self,
        release: &str,
        namespace: &str,
        revision: u32,
        ctx: &StepContext,
    ) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("rollback_chart", format!("rollback_chart:{release}:{revision}"))?;
        let history = cluster
            .releases
            .get_mut(&key(namespace, release))
            .ok_or_else(|| release_not_found(namespace, release))?;
        let target = history
            .iter()
            .find(|r| r.revision == revision)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound {
                kind: "revision",
                name: format!("{namespace}/{release}@{revision}"),
            })?;
        let next = history.last().map_or(1, |r| r.revision + 1);
        history.push(ReleaseInfo {
            revision: next,
            status: ReleaseInfo::DEPLOYED.to_string(),
            ..target
        });
        Ok(())
    }

    async fn service_annotations(
        &self,
        namespace: &str,
        service: &str,
        ctx: &StepContext,
    ) -> Result<BTreeMap<String, String>> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("service_annotations", format!("service_annotations:{service}"))?;
        cluster
            .services
            .get(&key(namespace, service))
            .cloned()
            .ok_or_else(|| service_not_found(namespace, service))
    }

    async fn annotate_service(
        &self,
        namespace: &str,
        service: &str,
        annotations: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("annotate_service", format!("annotate_service:{service}"))?;
        let current = cluster
            .services
            .get_mut(&key(namespace, service))
            .ok_or_else(|| service_not_found(namespace, service))?;
        current.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn remove_service_annotations(
        &self,
        namespace: &str,
        service: &str,
        keys: &[String],
        ctx: &StepContext,
    ) -> Result<()> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter(
            "remove_service_annotations",
            format!("remove_service_annotations:{service}"),
        )?;
        let current = cluster
            .services
            .get_mut(&key(namespace, service))
            .ok_or_else(|| service_not_found(namespace, service))?;
        for k in keys {
            current.remove(k);
        }
        Ok(())
    }

    async fn is_ready(&self, target: &ReadinessTarget, ctx: &StepContext) -> Result<bool> {
        ctx.check()?;
        let mut cluster = self.lock();
        cluster.enter("is_ready", format!("is_ready:{}", target.name()))?;
        Ok(!cluster.not_ready.contains(target))
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chart(version: &str) -> ChartSpec {
        ChartSpec {
            release: "traefik".to_string(),
            namespace: "ingress".to_string(),
            chart: "traefik/traefik".to_string(),
            repo: None,
            version: version.to_string(),
            values: json!({"replicas": 1}),
        }
    }

    #[tokio::test]
    async fn test_release_history_and_rollback() {
        let manager = MemoryResourceManager::new();
        let ctx = StepContext::new();

        manager.install_chart(&chart("26.0.0"), &ctx).await.unwrap();
        manager.upgrade_chart(&chart("26.1.0"), &ctx).await.unwrap();
        let deployed = manager.deployed("traefik", "ingress").unwrap();
        assert_eq!((deployed.revision, deployed.chart_version.as_str()), (2, "26.1.0"));
        assert_eq!(deployed.chart, "traefik");

        manager.rollback_chart("traefik", "ingress", 1, &ctx).await.unwrap();
        let deployed = manager.deployed("traefik", "ingress").unwrap();
        assert_eq!((deployed.revision, deployed.chart_version.as_str()), (3, "26.0.0"));
    }

    #[tokio::test]
    async fn test_install_over_existing_release_fails() {
        let manager = MemoryResourceManager::new().with_release(&chart("26.0.0"));
        let err = manager
            .install_chart(&chart("26.0.0"), &StepContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still in use"));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_logged() {
        let manager = MemoryResourceManager::new().fail_on("create_volume:data-1");
        let ctx = StepContext::new();
        let volume = |name: &str| VolumeSpec {
            name: name.to_string(),
            capacity: "1Gi".to_string(),
            host_path: format!("/srv/{name}").into(),
            access_modes: vec!["ReadWriteOnce".to_string()],
            storage_class: None,
        };

        manager.create_volume(&volume("data-0"), &ctx).await.unwrap();
        assert!(manager.create_volume(&volume("data-1"), &ctx).await.is_err());
        assert_eq!(
            manager.calls(),
            vec!["create_volume:data-0", "create_volume:data-1"]
        );
        assert!(manager.has_volume("data-0"));
        assert!(!manager.has_volume("data-1"));
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let manager = MemoryResourceManager::new();
        let err = manager
            .service_annotations("ingress", "traefik", &StepContext::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
