//! Chart component scenarios against the in-memory cluster

use nodeforge_resources::{
    ChartComponent, ChartSpec, ManagerProvider, MemoryResourceManager, ReadinessTarget,
    ResourceManager,
};
use nodeforge_workflow::{keys, ErrorKind, FailingStep, NoopNotifier, Step, StepContext, Workflow};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn quiet() -> StepContext {
    StepContext::new().with_notifier(Arc::new(NoopNotifier))
}

fn provider(manager: &Arc<MemoryResourceManager>) -> ManagerProvider {
    ManagerProvider::ready(manager.clone() as Arc<dyn ResourceManager>)
}

fn registry(storage: &Path) -> ChartComponent {
    let mut component: ChartComponent = toml::from_str(
        r#"
name = "registry"
namespace = "registry"
release = "zot"
chart = "zot"
version = "0.1.60"
timeout_secs = 1

[[volumes]]
name = "zot-data"
capacity = "50Gi"
host_path = "/var/lib/zot"

[service]
name = "zot"
annotations = { "lb.example.com/pool" = "edge" }

[[readiness]]
kind = "deployment"
namespace = "registry"
name = "zot"
"#,
    )
    .unwrap();
    component.storage_dirs = vec![storage.to_path_buf()];
    component
}

fn zot_deployment() -> ReadinessTarget {
    ReadinessTarget::Deployment {
        namespace: "registry".to_string(),
        name: "zot".to_string(),
    }
}

fn longhorn(version: &str, values: serde_json::Value) -> ChartSpec {
    ChartSpec {
        release: "longhorn".to_string(),
        namespace: "longhorn-system".to_string(),
        chart: "longhorn/longhorn".to_string(),
        repo: None,
        version: version.to_string(),
        values,
    }
}

fn longhorn_component(version: &str) -> ChartComponent {
    ChartComponent {
        name: "longhorn".to_string(),
        namespace: "longhorn-system".to_string(),
        release: None,
        chart: "longhorn/longhorn".to_string(),
        repo: None,
        version: version.to_string(),
        values: json!({}),
        storage_dirs: Vec::new(),
        volumes: Vec::new(),
        service: None,
        readiness: Vec::new(),
        timeout_secs: 60,
        migrate_below: None,
    }
}

#[tokio::test]
async fn fresh_install_then_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("zot");
    let manager = Arc::new(MemoryResourceManager::new().with_service("registry", "zot"));
    let component = registry(&storage);

    let workflow = component.install_workflow(&provider(&manager)).unwrap();
    let report = workflow.execute(&quiet()).await;

    assert!(report.is_success(), "{report:?}");
    assert!(storage.is_dir());
    assert!(manager.has_namespace("registry"));
    assert!(manager.has_volume("zot-data"));
    assert_eq!(manager.deployed("zot", "registry").unwrap().chart_version, "0.1.60");
    assert!(report.step("registry-ready").unwrap().flag(keys::READY));

    let again = component.install_workflow(&provider(&manager)).unwrap();
    let report = again.execute(&quiet()).await;
    assert!(report.is_success());
    for id in [
        "registry-storage",
        "registry-namespace",
        "registry-volumes",
        "registry-chart",
        "registry-annotate",
    ] {
        let step = report.step(id).unwrap();
        assert!(step.is_skipped(), "{id} should be skipped");
        assert!(step.flag(keys::ALREADY_EXISTS));
    }
}

#[tokio::test]
async fn failed_readiness_rolls_back_only_what_the_run_created() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("zot");
    let manager = Arc::new(
        MemoryResourceManager::new()
            .with_namespace("registry")
            .with_service_annotation("registry", "zot", "owner", "platform")
            .never_ready(zot_deployment()),
    );

    let workflow = registry(&storage)
        .install_workflow(&provider(&manager))
        .unwrap();
    let report = workflow.execute(&quiet()).await;

    assert!(report.is_failed());
    assert!(report.error().unwrap().is(ErrorKind::Installation));

    // Storage directories and the namespace predate or outlive the run
    assert!(storage.is_dir());
    assert!(manager.has_namespace("registry"));
    assert!(report.step("registry-namespace").unwrap().rollback().unwrap().is_skipped());

    assert!(!manager.has_volume("zot-data"));
    assert!(manager.deployed("zot", "registry").is_none());
    assert_eq!(
        manager.annotations("registry", "zot").into_iter().collect::<Vec<_>>(),
        vec![("owner".to_string(), "platform".to_string())]
    );

    let rolled_back: Vec<String> = manager
        .calls()
        .iter()
        .filter(|c| c.starts_with("delete_") || c.starts_with("uninstall_") || c.starts_with("remove_"))
        .map(|c| c.split(':').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        rolled_back,
        vec!["remove_service_annotations", "uninstall_chart", "delete_volume"]
    );
}

#[tokio::test]
async fn upgrade_is_skipped_when_up_to_date() {
    let manager = Arc::new(MemoryResourceManager::new().with_release(&longhorn("1.6.0", json!(null))));
    let step = longhorn_component("1.6.0").upgrade_step(&provider(&manager));

    let report = step.execute(&quiet()).await;
    assert!(report.is_skipped());
    assert!(report.flag(keys::ALREADY_UP_TO_DATE));
    assert!(step.rollback(&quiet()).await.is_skipped());
}

#[tokio::test]
async fn direct_upgrade_rolls_back_to_previous_revision() {
    let manager = Arc::new(MemoryResourceManager::new().with_release(&longhorn("1.6.0", json!({}))));
    let step = longhorn_component("1.6.2").upgrade_step(&provider(&manager));

    let report = step.execute(&quiet()).await;
    assert!(report.is_success());
    assert!(report.flag(keys::UPGRADED_BY_THIS_STEP));
    assert_eq!(report.meta(keys::PREVIOUS_REVISION), Some("1"));
    assert_eq!(manager.deployed("longhorn", "longhorn-system").unwrap().revision, 2);

    let rollback = step.rollback(&quiet()).await;
    assert!(rollback.is_success());
    let deployed = manager.deployed("longhorn", "longhorn-system").unwrap();
    assert_eq!(deployed.chart_version, "1.6.0");
    assert!(manager.calls().contains(&"rollback_chart:longhorn:1".to_string()));
}

#[tokio::test]
async fn values_change_alone_upgrades() {
    let manager = Arc::new(MemoryResourceManager::new().with_release(&longhorn("1.6.0", json!({}))));
    let mut component = longhorn_component("1.6.0");
    component.values = json!({"defaultSettings": {"replicaCount": 1}});

    let report = component
        .upgrade_step(&provider(&manager))
        .execute(&quiet())
        .await;
    assert!(report.flag(keys::UPGRADED_BY_THIS_STEP));
}

#[tokio::test]
async fn major_change_migrates_and_rollback_delegates() {
    let manager = Arc::new(MemoryResourceManager::new().with_release(&longhorn("1.6.0", json!({}))));
    let step = longhorn_component("2.0.0").upgrade_step(&provider(&manager));

    let report = step.execute(&quiet()).await;
    assert!(report.is_success(), "{report:?}");
    assert!(report.flag(keys::MIGRATED_BY_THIS_STEP));
    let migration = report.step("longhorn-migration").unwrap();
    assert!(migration.step("longhorn-uninstall-previous").unwrap().is_success());
    assert!(migration.step("longhorn-reinstall").unwrap().is_success());
    assert_eq!(
        manager.deployed("longhorn", "longhorn-system").unwrap().chart_version,
        "2.0.0"
    );

    let rollback = step.rollback(&quiet()).await;
    assert!(rollback.is_success());
    assert_eq!(rollback.step_reports().len(), 1);
    assert_eq!(
        manager.deployed("longhorn", "longhorn-system").unwrap().chart_version,
        "1.6.0"
    );
}

#[tokio::test]
async fn failed_migration_is_not_rolled_back_twice() {
    let manager = Arc::new(
        MemoryResourceManager::new()
            .with_release(&longhorn("1.6.0", json!({})))
            .fail_on("install_chart:longhorn:2.0.0"),
    );
    let step = longhorn_component("2.0.0").upgrade_step(&provider(&manager));

    let report = step.execute(&quiet()).await;
    assert!(report.is_failed());
    assert!(report.error().unwrap().is(ErrorKind::Installation));
    assert!(report.error().unwrap().message().contains("install_chart:longhorn:2.0.0"));

    // The migration restored the previous release on its own
    let migration = report.step("longhorn-migration").unwrap();
    let uninstall = migration.step("longhorn-uninstall-previous").unwrap();
    assert!(uninstall.rollback().unwrap().is_success());
    assert_eq!(
        manager.deployed("longhorn", "longhorn-system").unwrap().chart_version,
        "1.6.0"
    );

    let before = manager.calls().len();
    assert!(step.rollback(&quiet()).await.is_skipped());
    assert_eq!(manager.calls().len(), before);
}

#[tokio::test]
async fn outer_failure_reverts_upgrade() {
    let manager = Arc::new(MemoryResourceManager::new().with_release(&longhorn("1.6.0", json!({}))));
    let component = longhorn_component("1.6.1");
    let manager_provider = provider(&manager);

    let node = Workflow::builder("node")
        .step(component.install_workflow(&manager_provider).unwrap())
        .step(component.upgrade_step(&manager_provider))
        .step(FailingStep::new("agent", "agent failed").with_kind(ErrorKind::Configuration))
        .build()
        .unwrap();

    let report = node.execute(&quiet()).await;
    assert!(report.is_failed());
    assert!(report.error().unwrap().is(ErrorKind::Configuration));

    let upgrade = report.step("longhorn-upgrade").unwrap();
    assert!(upgrade.rollback().unwrap().is_success());
    // The release predates the run, so the install workflow had nothing to undo
    assert!(report.step("longhorn-resources").unwrap().rollback().unwrap().is_success());
    let deployed = manager.deployed("longhorn", "longhorn-system").unwrap();
    assert_eq!(deployed.chart_version, "1.6.0");
    assert!(!manager
        .calls()
        .iter()
        .any(|c| c.starts_with("uninstall_chart") || c.starts_with("delete_namespace")));
}

#[tokio::test]
async fn v_prefixed_deployed_version_is_up_to_date() {
    let manager = Arc::new(MemoryResourceManager::new().with_release(&longhorn("v1.6.0", json!({}))));
    let step = longhorn_component("1.6.0").upgrade_step(&provider(&manager));

    let report = step.execute(&quiet()).await;
    assert!(report.is_skipped(), "{report:?}");
    assert!(report.flag(keys::ALREADY_UP_TO_DATE));
    assert!(!manager.calls().iter().any(|c| c.starts_with("upgrade_chart")));
}

#[tokio::test]
async fn failed_release_is_not_counted_as_provisioned() {
    let manager = Arc::new(
        MemoryResourceManager::new()
            .with_release(&longhorn("1.6.0", json!({})))
            .with_release_status("longhorn", "longhorn-system", "failed"),
    );
    let component = longhorn_component("1.6.0");
    let manager_provider = provider(&manager);

    let install = component.install_workflow(&manager_provider).unwrap();
    let report = install.execute(&quiet()).await;
    assert!(report.is_success(), "{report:?}");
    let chart = report.step("longhorn-chart").unwrap();
    assert!(chart.flag(keys::CHART_INSTALLED_BY_THIS_STEP));
    assert_eq!(chart.meta(keys::REPLACED_RELEASE_STATUS), Some("failed"));
    assert!(manager.deployed("longhorn", "longhorn-system").unwrap().is_deployed());

    // Reinstalled at the requested version, so nothing is left to upgrade
    let upgrade = component.upgrade_step(&manager_provider);
    assert!(upgrade.execute(&quiet()).await.flag(keys::ALREADY_UP_TO_DATE));
}

#[tokio::test]
async fn failed_release_at_requested_version_is_upgraded() {
    let manager = Arc::new(
        MemoryResourceManager::new()
            .with_release(&longhorn("1.6.0", json!({})))
            .with_release_status("longhorn", "longhorn-system", "pending-install"),
    );
    let step = longhorn_component("1.6.0").upgrade_step(&provider(&manager));

    let report = step.execute(&quiet()).await;
    assert!(report.is_success(), "{report:?}");
    assert!(report.flag(keys::UPGRADED_BY_THIS_STEP));
    assert!(!report.flag(keys::ALREADY_UP_TO_DATE));
    let deployed = manager.deployed("longhorn", "longhorn-system").unwrap();
    assert_eq!(deployed.revision, 2);
    assert!(deployed.is_deployed());
}
