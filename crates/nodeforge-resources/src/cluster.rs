//! ResourceManager for a live cluster
//!
//! Namespaces, volumes, services and workload status go through the
//! Kubernetes API; releases go through the `helm` CLI.

use crate::error::{ResourceError, Result};
use crate::helm::HelmCli;
use crate::manager::{ChartSpec, ReadinessTarget, ReleaseInfo, ResourceManager, VolumeSpec};
use crate::steps::ManagerProvider;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, Namespace, PersistentVolume, PersistentVolumeSpec, Service,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Error as KubeError};
use nodeforge_workflow::{ErrorKind, Provider, StepContext};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY.to_string(), "nodeforge".to_string())])
}

fn is_status(err: &KubeError, code: u16) -> bool {
    matches!(err, KubeError::Api(response) if response.code == code)
}

/// Kubernetes API client plus Helm
pub struct ClusterManager {
    client: Client,
    helm: HelmCli,
    poll_interval: Duration,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("helm", &self.helm)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl ClusterManager {
    pub fn new(client: Client, helm: HelmCli) -> Self {
        Self {
            client,
            helm,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster config
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        info!("Connected to Kubernetes API");
        Ok(Self::new(client, HelmCli::new()))
    }

    /// Provider that connects on first use
    pub fn provider() -> ManagerProvider {
        Provider::new(|| async {
            match ClusterManager::connect().await {
                Ok(manager) => Ok(Arc::new(manager) as Arc<dyn ResourceManager>),
                Err(e) => Err(e
                    .into_step_error(ErrorKind::Internal)
                    .with_hint("check that the cluster is running and KUBECONFIG points at it")),
            }
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn service(&self, namespace: &str, service: &str, ctx: &StepContext) -> Result<Service> {
        ctx.guard(self.services(namespace).get_opt(service))
            .await??
            .ok_or_else(|| ResourceError::NotFound {
                kind: "service",
                name: format!("{namespace}/{service}"),
            })
    }
}

fn host_path_volume(volume: &VolumeSpec) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.name.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(volume.capacity.clone()),
            )])),
            access_modes: Some(volume.access_modes.clone()),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: volume.storage_class.clone(),
            host_path: Some(HostPathVolumeSource {
                path: volume.host_path.display().to_string(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let want = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = &deployment.status else {
        return false;
    };
    let current = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    };
    current
        && status.ready_replicas.unwrap_or(0) >= want
        && status.updated_replicas.unwrap_or(0) >= want
}

fn daemon_set_ready(daemon_set: &DaemonSet) -> bool {
    let Some(status) = &daemon_set.status else {
        return false;
    };
    let want = status.desired_number_scheduled;
    status.number_ready >= want && status.updated_number_scheduled.unwrap_or(0) >= want
}

fn stateful_set_ready(stateful_set: &StatefulSet) -> bool {
    let want = stateful_set
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    stateful_set
        .status
        .as_ref()
        .is_some_and(|s| s.ready_replicas.unwrap_or(0) >= want)
}

#[async_trait]
impl ResourceManager for ClusterManager {
    async fn namespace_exists(&self, name: &str, ctx: &StepContext) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(ctx.guard(api.get_opt(name)).await??.is_some())
    }

    async fn create_namespace(&self, name: &str, ctx: &StepContext) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(managed_labels()),
                ..Default::default()
            },
            ..Default::default()
        };
        match ctx.guard(api.create(&PostParams::default(), &namespace)).await? {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => {
                debug!(namespace = name, "Namespace created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str, ctx: &StepContext) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match ctx.guard(api.delete(name, &DeleteParams::default())).await? {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn volume_exists(&self, name: &str, ctx: &StepContext) -> Result<bool> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(ctx.guard(api.get_opt(name)).await??.is_some())
    }

    async fn create_volume(&self, volume: &VolumeSpec, ctx: &StepContext) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let pv = host_path_volume(volume);
        ctx.guard(api.create(&PostParams::default(), &pv)).await??;
        Ok(())
    }

    async fn delete_volume(&self, name: &str, ctx: &StepContext) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match ctx.guard(api.delete(name, &DeleteParams::default())).await? {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(
        &self,
        release: &str,
        namespace: &str,
        ctx: &StepContext,
    ) -> Result<Option<ReleaseInfo>> {
        self.helm.release(release, namespace, ctx).await
    }

    async fn install_chart(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        self.helm.install(chart, ctx).await
    }

    async fn upgrade_chart(&self, chart: &ChartSpec, ctx: &StepContext) -> Result<()> {
        self.helm.upgrade(chart, ctx).await
    }

    async fn uninstall_chart(&self, release: &str, namespace: &str, ctx: &StepContext) -> Result<()> {
        self.helm.uninstall(release, namespace, ctx).await
    }

    async fn rollback_chart(
        &self,
        release: &str,
        namespace: &str,
        revision: u32,
        ctx: &StepContext,
    ) -> Result<()> {
        self.helm.rollback(release, namespace, revision, ctx).await
    }

    async fn service_annotations(
        &self,
        namespace: &str,
        service: &str,
        ctx: &StepContext,
    ) -> Result<BTreeMap<String, String>> {
        let service = self.service(namespace, service, ctx).await?;
        Ok(service.metadata.annotations.unwrap_or_default())
    }

    async fn annotate_service(
        &self,
        namespace: &str,
        service: &str,
        annotations: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        ctx.guard(
            self.services(namespace)
                .patch(service, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await??;
        Ok(())
    }

    async fn remove_service_annotations(
        &self,
        namespace: &str,
        service: &str,
        keys: &[String],
        ctx: &StepContext,
    ) -> Result<()> {
        // Merge patch deletes keys set to null
        let nulls: serde_json::Map<String, serde_json::Value> = keys
            .iter()
            .map(|k| (k.clone(), serde_json::Value::Null))
            .collect();
        let patch = json!({ "metadata": { "annotations": nulls } });
        ctx.guard(
            self.services(namespace)
                .patch(service, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await??;
        Ok(())
    }

    async fn is_ready(&self, target: &ReadinessTarget, ctx: &StepContext) -> Result<bool> {
        let client = self.client.clone();
        let ready = match target {
            ReadinessTarget::Deployment { namespace, name } => {
                let api: Api<Deployment> = Api::namespaced(client, namespace);
                ctx.guard(api.get_opt(name))
                    .await??
                    .is_some_and(|d| deployment_ready(&d))
            }
            ReadinessTarget::DaemonSet { namespace, name } => {
                let api: Api<DaemonSet> = Api::namespaced(client, namespace);
                ctx.guard(api.get_opt(name))
                    .await??
                    .is_some_and(|d| daemon_set_ready(&d))
            }
            ReadinessTarget::StatefulSet { namespace, name } => {
                let api: Api<StatefulSet> = Api::namespaced(client, namespace);
                ctx.guard(api.get_opt(name))
                    .await??
                    .is_some_and(|s| stateful_set_ready(&s))
            }
        };
        Ok(ready)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
