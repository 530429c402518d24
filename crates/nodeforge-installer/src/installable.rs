//! The Installable contract

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use nodeforge_workflow::StepContext;
use std::fmt;
use std::sync::Mutex;

/// A software component with a two-phase install/configure lifecycle
///
/// The install phase runs `download`, `extract`, `install` and `cleanup`
/// in that order; `uninstall` is its coarse-grained undo. The configure
/// phase is `configure`, undone by `remove_configuration`.
#[async_trait]
pub trait Installable: Send + Sync {
    /// Component name, used in step ids
    fn name(&self) -> &str;

    /// Whether the component's binaries are already in place
    async fn is_installed(&self, ctx: &StepContext) -> Result<bool>;

    async fn download(&self, ctx: &StepContext) -> Result<()>;

    async fn extract(&self, ctx: &StepContext) -> Result<()>;

    async fn install(&self, ctx: &StepContext) -> Result<()>;

    /// Remove temporary files left by the earlier stages
    async fn cleanup(&self, ctx: &StepContext) -> Result<()>;

    async fn uninstall(&self, ctx: &StepContext) -> Result<()>;

    /// Whether the component's configuration is already applied
    async fn is_configured(&self, ctx: &StepContext) -> Result<bool>;

    async fn configure(&self, ctx: &StepContext) -> Result<()>;

    async fn remove_configuration(&self, ctx: &StepContext) -> Result<()>;
}

/// An [`Installable`] operation, as recorded by [`ScriptedInstallable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    IsInstalled,
    Download,
    Extract,
    Install,
    Cleanup,
    Uninstall,
    IsConfigured,
    Configure,
    RemoveConfiguration,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::IsInstalled => "is_installed",
            Operation::Download => "download",
            Operation::Extract => "extract",
            Operation::Install => "install",
            Operation::Cleanup => "cleanup",
            Operation::Uninstall => "uninstall",
            Operation::IsConfigured => "is_configured",
            Operation::Configure => "configure",
            Operation::RemoveConfiguration => "remove_configuration",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    installed: bool,
    configured: bool,
    calls: Vec<Operation>,
}

/// In-memory [`Installable`] with scripted failures
///
/// `install` marks the component installed and `uninstall` clears it;
/// `configure` and `remove_configuration` do the same for configuration.
#[derive(Debug)]
pub struct ScriptedInstallable {
    name: String,
    fail_at: Vec<Operation>,
    state: Mutex<ScriptState>,
}

impl ScriptedInstallable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_at: Vec::new(),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Start out installed
    pub fn installed(self) -> Self {
        self.state().installed = true;
        self
    }

    /// Start out configured
    pub fn configured(self) -> Self {
        self.state().configured = true;
        self
    }

    /// Make `operation` fail
    pub fn failing_at(mut self, operation: Operation) -> Self {
        self.fail_at.push(operation);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Operations called so far, in order
    pub fn calls(&self) -> Vec<Operation> {
        self.state().calls.clone()
    }

    pub fn is_installed_now(&self) -> bool {
        self.state().installed
    }

    pub fn is_configured_now(&self) -> bool {
        self.state().configured
    }

    fn call(&self, operation: Operation) -> Result<()> {
        self.state().calls.push(operation);
        if self.fail_at.contains(&operation) {
            return Err(InstallerError::Failed(format!(
                "{} {operation} failed",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Installable for ScriptedInstallable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_installed(&self, _ctx: &StepContext) -> Result<bool> {
        self.call(Operation::IsInstalled)?;
        Ok(self.state().installed)
    }

    async fn download(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::Download)
    }

    async fn extract(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::Extract)
    }

    async fn install(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::Install)?;
        self.state().installed = true;
        Ok(())
    }

    async fn cleanup(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::Cleanup)
    }

    async fn uninstall(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::Uninstall)?;
        self.state().installed = false;
        Ok(())
    }

    async fn is_configured(&self, _ctx: &StepContext) -> Result<bool> {
        self.call(Operation::IsConfigured)?;
        Ok(self.state().configured)
    }

    async fn configure(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::Configure)?;
        self.state().configured = true;
        Ok(())
    }

    async fn remove_configuration(&self, _ctx: &StepContext) -> Result<()> {
        self.call(Operation::RemoveConfiguration)?;
        self.state().configured = false;
        Ok(())
    }
}
