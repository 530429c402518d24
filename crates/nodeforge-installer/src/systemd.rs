//! systemd unit management

use crate::command::CommandRunner;
use crate::error::{InstallerError, Result};
use crate::template;
use nodeforge_workflow::StepContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

/// Default directory for unit files written by nodeforge
pub const UNIT_DIR: &str = "/etc/systemd/system";

const UNIT_TEMPLATE: &str = r#"[Unit]
Description={{ description }}
{% for unit in after %}
After={{ unit }}
{% endfor %}
{% for unit in wants %}
Wants={{ unit }}
{% endfor %}

[Service]
Type={{ service_type }}
ExecStart={{ exec_start }}
{% for key, value in environment|items %}
Environment="{{ key }}={{ value }}"
{% endfor %}
Restart={{ restart }}
RestartSec={{ restart_sec }}
{% if limit_nofile %}
LimitNOFILE={{ limit_nofile }}
{% endif %}
{% if delegate %}
Delegate=yes
KillMode=process
{% endif %}

[Install]
WantedBy={{ wanted_by }}
"#;

fn default_after() -> Vec<String> {
    vec!["network-online.target".to_string()]
}

fn default_service_type() -> String {
    "simple".to_string()
}

fn default_restart() -> String {
    "always".to_string()
}

fn default_restart_sec() -> u32 {
    5
}

fn default_wanted_by() -> String {
    "multi-user.target".to_string()
}

/// Description of a systemd service unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Unit name, with or without the `.service` suffix
    pub name: String,
    pub description: String,
    pub exec_start: String,

    #[serde(default = "default_after")]
    pub after: Vec<String>,

    #[serde(default)]
    pub wants: Vec<String>,

    #[serde(default = "default_service_type")]
    pub service_type: String,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "default_restart")]
    pub restart: String,

    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,

    #[serde(default)]
    pub limit_nofile: Option<u64>,

    /// Let the service manage its own cgroup, as container runtimes need
    #[serde(default)]
    pub delegate: bool,

    #[serde(default = "default_wanted_by")]
    pub wanted_by: String,
}

impl UnitSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        exec_start: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            exec_start: exec_start.into(),
            after: default_after(),
            wants: Vec::new(),
            service_type: default_service_type(),
            environment: BTreeMap::new(),
            restart: default_restart(),
            restart_sec: default_restart_sec(),
            limit_nofile: None,
            delegate: false,
            wanted_by: default_wanted_by(),
        }
    }

    /// File name of the unit, e.g. `containerd.service`
    pub fn file_name(&self) -> String {
        if self.name.ends_with(".service") {
            self.name.clone()
        } else {
            format!("{}.service", self.name)
        }
    }

    /// Render the unit file contents
    pub fn render(&self) -> Result<String> {
        template::render(UNIT_TEMPLATE, self)
    }
}

/// Writes unit files and drives `systemctl`
#[derive(Clone)]
pub struct Systemd {
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Systemd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Systemd")
            .field("unit_dir", &self.unit_dir)
            .finish()
    }
}

impl Systemd {
    pub fn new(unit_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            runner,
        }
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }

    pub fn unit_path(&self, unit: &UnitSpec) -> PathBuf {
        self.unit_dir.join(unit.file_name())
    }

    pub async fn daemon_reload(&self, ctx: &StepContext) -> Result<()> {
        self.runner
            .run("systemctl", &["daemon-reload"], ctx)
            .await
            .map(|_| ())
    }

    pub async fn enable_now(&self, unit: &UnitSpec, ctx: &StepContext) -> Result<()> {
        let name = unit.file_name();
        self.runner
            .run("systemctl", &["enable", "--now", &name], ctx)
            .await
            .map(|_| ())
    }

    pub async fn disable_now(&self, unit: &UnitSpec, ctx: &StepContext) -> Result<()> {
        let name = unit.file_name();
        self.runner
            .run("systemctl", &["disable", "--now", &name], ctx)
            .await
            .map(|_| ())
    }

    /// Whether the unit file on disk matches the rendered unit
    pub async fn is_current(&self, unit: &UnitSpec) -> Result<bool> {
        let wanted = unit.render()?;
        Ok(matches!(
            fs::read_to_string(self.unit_path(unit)).await,
            Ok(existing) if existing == wanted
        ))
    }

    /// Write the unit, reload systemd, then enable and start it
    pub async fn install_unit(&self, unit: &UnitSpec, ctx: &StepContext) -> Result<()> {
        let contents = unit.render()?;
        let path = self.unit_path(unit);
        write_file(&path, &contents, 0o644).await?;
        info!(unit = %unit.file_name(), path = %path.display(), "Wrote unit file");

        self.daemon_reload(ctx).await?;
        self.enable_now(unit, ctx).await
    }

    /// Stop, disable and delete the unit
    ///
    /// A failing `disable` is tolerated since the unit may never have
    /// been loaded.
    pub async fn remove_unit(&self, unit: &UnitSpec, ctx: &StepContext) -> Result<()> {
        if let Err(e) = self.disable_now(unit, ctx).await {
            warn!(unit = %unit.file_name(), error = %e, "Failed to disable unit");
        }
        remove_file_if_exists(&self.unit_path(unit)).await?;
        self.daemon_reload(ctx).await
    }
}

/// Write `contents` to `path` with `mode`, creating parent directories
pub(crate) async fn write_file(path: &Path, contents: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(InstallerError::io(parent))?;
    }
    fs::write(path, contents)
        .await
        .map_err(InstallerError::io(path))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(InstallerError::io(path))
}

/// Remove a file, treating a missing file as success
pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(InstallerError::io(path)(e)),
    }
}
