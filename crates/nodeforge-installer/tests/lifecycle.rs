//! Install/configure scenarios against a real filesystem

use nodeforge_installer::{
    lifecycle_workflow, ArchiveFormat, ArtifactSource, BinarySpec, ConfigFile, ConfigurationSpec,
    Installable, Layout, Operation, RecordingRunner, ReleaseInstallable, ReleaseSpec,
    ScriptedInstallable, UnitSpec,
};
use nodeforge_workflow::{keys, ErrorKind, NoopNotifier, Step, StepContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn quiet() -> StepContext {
    StepContext::new().with_notifier(Arc::new(NoopNotifier))
}

struct Fixture {
    dir: TempDir,
    runner: Arc<RecordingRunner>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("dist/runc.amd64");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"runc binary").unwrap();
        Self {
            dir,
            runner: Arc::new(RecordingRunner::new()),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn layout(&self) -> Layout {
        Layout {
            install_dir: self.path("bin"),
            work_dir: self.path("work"),
            unit_dir: self.path("units"),
        }
    }

    fn spec(&self, config_template: &str) -> ReleaseSpec {
        ReleaseSpec {
            name: "runc".to_string(),
            version: "1.1.12".to_string(),
            source: ArtifactSource::Path(self.path("dist/runc.amd64")),
            format: ArchiveFormat::Binary,
            binaries: vec![BinarySpec {
                archive_path: "runc.amd64".to_string(),
                target_name: Some("runc".to_string()),
            }],
            install_dir: None,
            configuration: Some(ConfigurationSpec {
                files: vec![ConfigFile {
                    path: self.path("etc/runc/config"),
                    template: config_template.to_string(),
                    mode: 0o644,
                }],
                unit: Some(UnitSpec::new("runc-shim", "runc shim", "{{ install_dir }}/runc")),
                vars: Default::default(),
            }),
        }
    }

    fn release(&self, spec: ReleaseSpec, layout: &Layout) -> Arc<dyn Installable> {
        Arc::new(ReleaseInstallable::new(spec, layout, self.runner.clone()).unwrap())
    }
}

fn artifact(layout: &Layout) -> PathBuf {
    layout.work_dir.join("runc-1.1.12/runc.amd64")
}

/// A regular file, so that any path below it is unusable
fn blocker(path: &Path) -> PathBuf {
    std::fs::write(path, b"").unwrap();
    path.to_path_buf()
}

#[tokio::test]
async fn fresh_run_then_rerun() {
    let fx = Fixture::new();
    let layout = fx.layout();
    let spec = fx.spec("version = {{ version }}\n");

    let first = lifecycle_workflow(fx.release(spec.clone(), &layout)).unwrap();
    let report = first.execute(&quiet()).await;

    assert!(report.is_success(), "{report:?}");
    let install = report.step("install-runc").unwrap();
    for key in [
        keys::DOWNLOADED_BY_THIS_STEP,
        keys::EXTRACTED_BY_THIS_STEP,
        keys::INSTALLED_BY_THIS_STEP,
        keys::CLEANED_UP_BY_THIS_STEP,
    ] {
        assert!(install.flag(key), "missing {key}");
    }
    let configure = report.step("configure-runc").unwrap();
    assert!(configure.flag(keys::CONFIGURED_BY_THIS_STEP));
    assert_eq!(
        std::fs::read_to_string(fx.path("bin/runc")).unwrap(),
        "runc binary"
    );
    assert_eq!(
        std::fs::read_to_string(fx.path("etc/runc/config")).unwrap(),
        "version = 1.1.12\n"
    );

    // A new process run against the same host does nothing
    let second = lifecycle_workflow(fx.release(spec, &layout)).unwrap();
    let report = second.execute(&quiet()).await;

    assert!(report.is_success());
    let install = report.step("install-runc").unwrap();
    assert!(install.is_skipped());
    assert!(install.flag(keys::ALREADY_INSTALLED));
    assert!(!install.flag(keys::INSTALLED_BY_THIS_STEP));
    let configure = report.step("configure-runc").unwrap();
    assert!(configure.is_skipped());
    assert!(configure.flag(keys::ALREADY_CONFIGURED));

    // Rolling back the re-run leaves the earlier run's state alone
    let rollback = second.rollback(&quiet()).await;
    assert!(rollback.step_reports().iter().all(|r| r.is_skipped()));
    assert!(fx.path("bin/runc").exists());
    assert!(fx.path("etc/runc/config").exists());
}

#[tokio::test]
async fn configuration_failure_after_install() {
    let fx = Fixture::new();
    let layout = fx.layout();
    // undefined variable
    let spec = fx.spec("root = {{ vars.data_dir }}\n");

    let workflow = lifecycle_workflow(fx.release(spec, &layout)).unwrap();
    let report = workflow.execute(&quiet()).await;

    assert!(report.is_failed());
    assert!(report.error().unwrap().is(ErrorKind::Configuration));

    let configure = report.step("configure-runc").unwrap();
    assert!(configure.rollback().unwrap().is_skipped());

    let install = report.step("install-runc").unwrap();
    assert!(install.rollback().unwrap().is_success());
    assert!(!fx.path("bin/runc").exists());
    assert!(fx.runner.commands().is_empty());
}

#[tokio::test]
async fn download_target_unusable() {
    let fx = Fixture::new();
    let mut layout = fx.layout();
    layout.work_dir = blocker(&fx.path("work-file")).join("work");

    let workflow = lifecycle_workflow(fx.release(fx.spec("x\n"), &layout)).unwrap();
    let report = workflow.execute(&quiet()).await;

    assert!(report.error().unwrap().is(ErrorKind::Download));
    let install = report.step("install-runc").unwrap();
    assert!(!install.flag(keys::DOWNLOADED_BY_THIS_STEP));
    assert!(install.rollback().unwrap().is_skipped());
    assert!(report.step("configure-runc").is_none());
}

#[tokio::test]
async fn install_target_unusable() {
    let fx = Fixture::new();
    let mut layout = fx.layout();
    layout.install_dir = blocker(&fx.path("bin-file")).join("bin");

    let workflow = lifecycle_workflow(fx.release(fx.spec("x\n"), &layout)).unwrap();
    let report = workflow.execute(&quiet()).await;

    assert!(report.error().unwrap().is(ErrorKind::Installation));
    let install = report.step("install-runc").unwrap();
    assert!(install.flag(keys::DOWNLOADED_BY_THIS_STEP));
    assert!(install.flag(keys::EXTRACTED_BY_THIS_STEP));
    assert!(install.rollback().unwrap().is_skipped());
    // Earlier stages are not unwound
    assert!(artifact(&layout).exists());
}

#[tokio::test]
async fn cleanup_failure_rolls_back_installed_binaries() {
    let target = Arc::new(ScriptedInstallable::new("cni").failing_at(Operation::Cleanup));
    let workflow = lifecycle_workflow(target.clone()).unwrap();

    let report = workflow.execute(&quiet()).await;

    assert!(report.error().unwrap().is(ErrorKind::Cleanup));
    let install = report.step("install-cni").unwrap();
    assert!(install.flag(keys::INSTALLED_BY_THIS_STEP));
    assert!(install.rollback().unwrap().is_success());
    assert!(!target.is_installed_now());
    assert!(target.calls().contains(&Operation::Uninstall));
}

/// Delegates to a real release, but turns the extracted tree into a regular
/// file before cleanup so that removing it fails
struct UnremovableExtract {
    inner: ReleaseInstallable,
    extracted: PathBuf,
}

#[async_trait::async_trait]
impl Installable for UnremovableExtract {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn is_installed(&self, ctx: &StepContext) -> nodeforge_installer::Result<bool> {
        self.inner.is_installed(ctx).await
    }

    async fn download(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        self.inner.download(ctx).await
    }

    async fn extract(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        self.inner.extract(ctx).await
    }

    async fn install(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        self.inner.install(ctx).await
    }

    async fn cleanup(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        std::fs::remove_dir_all(&self.extracted).unwrap();
        blocker(&self.extracted);
        self.inner.cleanup(ctx).await
    }

    async fn uninstall(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        self.inner.uninstall(ctx).await
    }

    async fn is_configured(&self, ctx: &StepContext) -> nodeforge_installer::Result<bool> {
        self.inner.is_configured(ctx).await
    }

    async fn configure(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        self.inner.configure(ctx).await
    }

    async fn remove_configuration(&self, ctx: &StepContext) -> nodeforge_installer::Result<()> {
        self.inner.remove_configuration(ctx).await
    }
}

#[tokio::test]
async fn release_cleanup_failure_removes_installed_binary() {
    let fx = Fixture::new();
    let layout = fx.layout();
    let target = Arc::new(UnremovableExtract {
        inner: ReleaseInstallable::new(fx.spec("x\n"), &layout, fx.runner.clone()).unwrap(),
        extracted: layout.work_dir.join("runc-1.1.12/extracted"),
    });
    let workflow = lifecycle_workflow(target).unwrap();

    let report = workflow.execute(&quiet()).await;

    assert!(report.error().unwrap().is(ErrorKind::Cleanup), "{report:?}");
    let install = report.step("install-runc").unwrap();
    assert!(install.flag(keys::INSTALLED_BY_THIS_STEP));
    assert!(!install.flag(keys::CLEANED_UP_BY_THIS_STEP));
    assert!(install.rollback().unwrap().is_success());
    assert!(!fx.path("bin/runc").exists());
    assert!(report.step("configure-runc").is_none());
}

#[tokio::test]
async fn reused_artifact_is_not_downloaded_again() {
    let fx = Fixture::new();
    let layout = fx.layout();
    let release = ReleaseInstallable::new(fx.spec("x\n"), &layout, fx.runner.clone()).unwrap();
    let ctx = quiet();

    release.download(&ctx).await.unwrap();
    std::fs::remove_file(fx.path("dist/runc.amd64")).unwrap();

    // Source is gone, but the cached artifact satisfies download
    release.download(&ctx).await.unwrap();
    release.extract(&ctx).await.unwrap();
    assert!(artifact(&layout).exists());
}
