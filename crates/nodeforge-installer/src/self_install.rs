//! Installing the running nodeforge binary

use crate::command::CommandRunner;
use crate::error::{InstallerError, Result};
use crate::installable::Installable;
use crate::systemd::{remove_file_if_exists, Systemd, UnitSpec};
use async_trait::async_trait;
use nodeforge_workflow::StepContext;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::info;

/// Default install location of the nodeforge binary
pub const SELF_TARGET: &str = "/usr/local/bin/nodeforge";

/// [`Installable`] that copies the current executable into place
pub struct SelfInstallable {
    name: String,
    target: PathBuf,
    source_override: Option<PathBuf>,
    disallowed: Vec<PathBuf>,
    unit: Option<UnitSpec>,
    systemd: Systemd,
}

impl std::fmt::Debug for SelfInstallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfInstallable")
            .field("target", &self.target)
            .field("source_override", &self.source_override)
            .field("unit", &self.unit.as_ref().map(|u| u.file_name()))
            .finish()
    }
}

impl SelfInstallable {
    pub fn new(target: impl Into<PathBuf>, unit_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            name: "nodeforge".to_string(),
            target: target.into(),
            source_override: None,
            disallowed: vec![std::env::temp_dir()],
            unit: None,
            systemd: Systemd::new(unit_dir, runner),
        }
    }

    /// Install from `source` instead of the current executable
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source_override = Some(source.into());
        self
    }

    /// Refuse to install from anywhere under these directories
    pub fn with_disallowed(mut self, prefixes: Vec<PathBuf>) -> Self {
        self.disallowed = prefixes;
        self
    }

    /// Run the installed binary as a systemd service
    pub fn with_unit(mut self, unit: UnitSpec) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn source(&self) -> Result<PathBuf> {
        let source = match &self.source_override {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| InstallerError::Environment {
                message: format!("cannot locate the running executable: {e}"),
                hint: format!(
                    "copy the nodeforge binary to {} manually and run it from there",
                    self.target.display()
                ),
            })?,
        };

        if let Some(prefix) = self.disallowed.iter().find(|p| source.starts_with(p)) {
            return Err(InstallerError::Environment {
                message: format!(
                    "refusing to install from {} (inside {})",
                    source.display(),
                    prefix.display()
                ),
                hint: format!(
                    "move the binary out of {} and run `nodeforge install` again",
                    prefix.display()
                ),
            });
        }
        Ok(source)
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.target.as_os_str().to_owned();
        name.push(".new");
        PathBuf::from(name)
    }
}

#[async_trait]
impl Installable for SelfInstallable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_installed(&self, _ctx: &StepContext) -> Result<bool> {
        let Ok(source) = self.source() else {
            // download surfaces the environment error
            return Ok(false);
        };
        if source == self.target {
            return Ok(true);
        }
        let (Ok(ours), Ok(theirs)) = (fs::read(&source).await, fs::read(&self.target).await) else {
            return Ok(false);
        };
        Ok(ours == theirs)
    }

    async fn download(&self, _ctx: &StepContext) -> Result<()> {
        let source = self.source()?;
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(InstallerError::MissingArtifact(source));
        }
        Ok(())
    }

    async fn extract(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    async fn install(&self, _ctx: &StepContext) -> Result<()> {
        let source = self.source()?;
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(InstallerError::io(parent))?;
        }

        // The target may be a running binary; replace it by rename
        let staging = self.staging_path();
        fs::copy(&source, &staging)
            .await
            .map_err(InstallerError::io(&staging))?;
        fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(InstallerError::io(&staging))?;
        fs::rename(&staging, &self.target)
            .await
            .map_err(InstallerError::io(&self.target))?;

        info!(from = %source.display(), to = %self.target.display(), "Installed nodeforge binary");
        Ok(())
    }

    async fn cleanup(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    async fn uninstall(&self, _ctx: &StepContext) -> Result<()> {
        remove_file_if_exists(&self.target).await?;
        info!(path = %self.target.display(), "Removed nodeforge binary");
        Ok(())
    }

    async fn is_configured(&self, _ctx: &StepContext) -> Result<bool> {
        match &self.unit {
            Some(unit) => self.systemd.is_current(unit).await,
            None => Ok(true),
        }
    }

    async fn configure(&self, ctx: &StepContext) -> Result<()> {
        match &self.unit {
            Some(unit) => self.systemd.install_unit(unit, ctx).await,
            None => Ok(()),
        }
    }

    async fn remove_configuration(&self, ctx: &StepContext) -> Result<()> {
        match &self.unit {
            Some(unit) => self.systemd.remove_unit(unit, ctx).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingRunner;

    fn installable(dir: &Path) -> SelfInstallable {
        SelfInstallable::new(
            dir.join("bin/nodeforge"),
            dir.join("units"),
            Arc::new(RecordingRunner::new()),
        )
    }

    #[tokio::test]
    async fn test_disallowed_source_is_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("downloads/nodeforge");
        let installable = installable(dir.path())
            .with_source(&source)
            .with_disallowed(vec![dir.path().join("downloads")]);

        let err = installable.download(&StepContext::new()).await.unwrap_err();
        match err {
            InstallerError::Environment { message, hint } => {
                assert!(message.contains("refusing to install"));
                assert!(hint.contains("move the binary"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!installable.is_installed(&StepContext::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_install_copies_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("build/nodeforge");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"binary v1").unwrap();
        let installable = installable(dir.path())
            .with_source(&source)
            .with_disallowed(Vec::new());
        let ctx = StepContext::new();

        assert!(!installable.is_installed(&ctx).await.unwrap());
        installable.download(&ctx).await.unwrap();
        installable.install(&ctx).await.unwrap();
        assert!(installable.is_installed(&ctx).await.unwrap());

        let mode = std::fs::metadata(installable.target())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);

        // a rebuilt binary is no longer installed
        std::fs::write(&source, b"binary v2").unwrap();
        assert!(!installable.is_installed(&ctx).await.unwrap());

        installable.uninstall(&ctx).await.unwrap();
        assert!(!installable.target().exists());
    }

    #[tokio::test]
    async fn test_without_unit_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let installable = installable(dir.path());
        assert!(installable.is_configured(&StepContext::new()).await.unwrap());
    }
}
