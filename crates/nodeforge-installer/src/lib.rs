//! nodeforge Installers
//!
//! Binary and package components are provisioned in two phases. The
//! install phase fetches an artifact, unpacks it, copies binaries into
//! place and cleans up; the configure phase writes config files and
//! systemd units. Each phase is one [`Step`](nodeforge_workflow::Step):
//!
//! ```text
//! InstallStep:   is_installed? ─▶ download ─▶ extract ─▶ install ─▶ cleanup
//!                rollback: uninstall (only if this run installed)
//!
//! ConfigureStep: is_configured? ─▶ configure
//!                rollback: remove_configuration (only if this run configured)
//! ```
//!
//! Components plug in through the [`Installable`] trait.
//! [`ReleaseInstallable`] covers anything described by a [`ReleaseSpec`];
//! [`SelfInstallable`] installs the running nodeforge binary.

pub mod command;
pub mod error;
pub mod fetch;
pub mod installable;
pub mod release;
pub mod self_install;
pub mod steps;
pub mod systemd;
pub mod template;

pub use command::{CommandOutput, CommandRunner, RecordingRunner, TokioCommandRunner};
pub use error::{InstallerError, Result};
pub use installable::{Installable, Operation, ScriptedInstallable};
pub use release::{
    ArchiveFormat, ArtifactSource, BinarySpec, ConfigFile, ConfigurationSpec, Layout,
    ReleaseInstallable, ReleaseSpec,
};
pub use self_install::{SelfInstallable, SELF_TARGET};
pub use steps::{ConfigureStep, InstallStep, PhaseRecord};
pub use systemd::{Systemd, UnitSpec};

use nodeforge_workflow::{BuildError, Workflow};
use std::sync::Arc;

/// Workflow running the install phase and then the configure phase
pub fn lifecycle_workflow(target: Arc<dyn Installable>) -> std::result::Result<Workflow, BuildError> {
    Workflow::builder(format!("{}-lifecycle", target.name()))
        .step(InstallStep::new(target.clone()))
        .step(ConfigureStep::new(target))
        .build()
}
