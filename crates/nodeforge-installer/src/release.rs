//! Release-archive installables
//!
//! A [`ReleaseSpec`] describes a component shipped as a tarball or a bare
//! binary: where to fetch it, which files to install, and optionally which
//! config files and systemd unit make up its configuration.

use crate::command::CommandRunner;
use crate::error::{InstallerError, Result};
use crate::fetch;
use crate::installable::Installable;
use crate::systemd::{remove_file_if_exists, write_file, Systemd, UnitSpec};
use crate::template;
use async_trait::async_trait;
use nodeforge_workflow::StepContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Where a release artifact comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// HTTP(S) URL; may reference `{{ name }}` and `{{ version }}`
    Url(String),
    /// File on the local filesystem
    Path(PathBuf),
}

/// Packaging of a release artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    #[default]
    TarGz,
    /// The artifact is the binary itself
    Binary,
}

/// A file to install from the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinarySpec {
    /// Path inside the archive
    pub archive_path: String,
    /// Installed file name; defaults to the last component of `archive_path`
    #[serde(default)]
    pub target_name: Option<String>,
}

impl BinarySpec {
    pub fn new(archive_path: impl Into<String>) -> Self {
        Self {
            archive_path: archive_path.into(),
            target_name: None,
        }
    }

    pub fn target_name(&self) -> &str {
        match &self.target_name {
            Some(name) => name,
            None => self
                .archive_path
                .rsplit('/')
                .next()
                .unwrap_or(&self.archive_path),
        }
    }
}

fn default_file_mode() -> u32 {
    0o644
}

/// A templated configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub template: String,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
}

/// Configure phase of a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpec {
    #[serde(default)]
    pub files: Vec<ConfigFile>,
    #[serde(default)]
    pub unit: Option<UnitSpec>,
    /// Template variables
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
}

/// Data description of a release-archive component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub name: String,
    pub version: String,
    pub source: ArtifactSource,
    #[serde(default)]
    pub format: ArchiveFormat,
    pub binaries: Vec<BinarySpec>,
    /// Overrides the node-wide install directory
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub configuration: Option<ConfigurationSpec>,
}

impl ReleaseSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(InstallerError::InvalidConfiguration(
                "release name must not be empty".to_string(),
            ));
        }
        if self.binaries.is_empty() {
            return Err(InstallerError::InvalidConfiguration(format!(
                "release '{}' lists no binaries",
                self.name
            )));
        }
        if self.format == ArchiveFormat::Binary && self.binaries.len() != 1 {
            return Err(InstallerError::InvalidConfiguration(format!(
                "release '{}' is a bare binary but lists {} binaries",
                self.name,
                self.binaries.len()
            )));
        }
        Ok(())
    }
}

/// Node-wide directories used by installables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Where binaries are installed
    pub install_dir: PathBuf,
    /// Scratch space for downloads and extraction
    pub work_dir: PathBuf,
    /// Where unit files are written
    pub unit_dir: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/usr/local/bin"),
            work_dir: PathBuf::from("/var/lib/nodeforge/work"),
            unit_dir: PathBuf::from(crate::systemd::UNIT_DIR),
        }
    }
}

/// [`Installable`] driven by a [`ReleaseSpec`]
pub struct ReleaseInstallable {
    spec: ReleaseSpec,
    install_dir: PathBuf,
    work_dir: PathBuf,
    systemd: Systemd,
    http: reqwest::Client,
}

impl std::fmt::Debug for ReleaseInstallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseInstallable")
            .field("name", &self.spec.name)
            .field("version", &self.spec.version)
            .field("install_dir", &self.install_dir)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl ReleaseInstallable {
    pub fn new(spec: ReleaseSpec, layout: &Layout, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        spec.validate()?;
        let install_dir = spec
            .install_dir
            .clone()
            .unwrap_or_else(|| layout.install_dir.clone());
        let work_dir = layout
            .work_dir
            .join(format!("{}-{}", spec.name, spec.version));
        Ok(Self {
            spec,
            install_dir,
            work_dir,
            systemd: Systemd::new(&layout.unit_dir, runner),
            http: reqwest::Client::new(),
        })
    }

    /// Use a preconfigured HTTP client
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn spec(&self) -> &ReleaseSpec {
        &self.spec
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn extracted_dir(&self) -> PathBuf {
        self.work_dir.join("extracted")
    }

    fn target_path(&self, binary: &BinarySpec) -> PathBuf {
        self.install_dir.join(binary.target_name())
    }

    /// Context shared by every template of this release
    fn template_context(&self) -> serde_json::Value {
        let vars = self
            .spec
            .configuration
            .as_ref()
            .map(|c| c.vars.clone())
            .unwrap_or_default();
        serde_json::json!({
            "name": self.spec.name,
            "version": self.spec.version,
            "install_dir": self.install_dir,
            "vars": vars,
        })
    }

    fn resolve_source(&self) -> Result<Source<'_>> {
        match &self.spec.source {
            ArtifactSource::Url(url) => Ok(Source::Url(template::render(
                url,
                self.template_context(),
            )?)),
            ArtifactSource::Path(path) => Ok(Source::Path(path)),
        }
    }

    /// Local path of the downloaded artifact
    pub fn artifact_path(&self) -> Result<PathBuf> {
        let name = match self.resolve_source()? {
            Source::Url(url) => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    InstallerError::InvalidConfiguration(format!("cannot name artifact for {url}"))
                })?,
            Source::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| InstallerError::MissingArtifact(path.to_path_buf()))?,
        };
        Ok(self.work_dir.join(name))
    }

    /// Rendered `(path, contents, mode)` of every config file
    fn rendered_files(&self) -> Result<Vec<(PathBuf, String, u32)>> {
        let Some(config) = &self.spec.configuration else {
            return Ok(Vec::new());
        };
        let context = self.template_context();
        config
            .files
            .iter()
            .map(|file| {
                let contents = template::render(&file.template, &context)?;
                Ok((file.path.clone(), contents, file.mode))
            })
            .collect()
    }

    /// The configured unit with `exec_start` and environment rendered
    fn unit(&self) -> Result<Option<UnitSpec>> {
        let Some(unit) = self.spec.configuration.as_ref().and_then(|c| c.unit.as_ref()) else {
            return Ok(None);
        };
        let context = self.template_context();
        let mut unit = unit.clone();
        unit.exec_start = template::render(&unit.exec_start, &context)?;
        for value in unit.environment.values_mut() {
            *value = template::render(value, &context)?;
        }
        Ok(Some(unit))
    }
}

enum Source<'a> {
    Url(String),
    Path(&'a Path),
}

#[async_trait]
impl Installable for ReleaseInstallable {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn is_installed(&self, _ctx: &StepContext) -> Result<bool> {
        for binary in &self.spec.binaries {
            let path = self.target_path(binary);
            let is_file = fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                debug!(release = %self.spec.name, path = %path.display(), "Binary missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn download(&self, ctx: &StepContext) -> Result<()> {
        fs::create_dir_all(&self.work_dir)
            .await
            .map_err(InstallerError::io(&self.work_dir))?;

        let artifact = self.artifact_path()?;
        if fs::try_exists(&artifact).await.unwrap_or(false) {
            info!(release = %self.spec.name, path = %artifact.display(), "Reusing downloaded artifact");
            return Ok(());
        }

        match self.resolve_source()? {
            Source::Url(url) => {
                fetch::download_to(&self.http, &url, &artifact, ctx).await?;
            }
            Source::Path(path) => {
                fetch::copy_file(path, &artifact).await?;
                info!(release = %self.spec.name, from = %path.display(), "Copied local artifact");
            }
        }
        Ok(())
    }

    async fn extract(&self, ctx: &StepContext) -> Result<()> {
        let artifact = self.artifact_path()?;
        let extracted = self.extracted_dir();
        match fs::remove_dir_all(&extracted).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(InstallerError::io(&extracted)(e)),
        }
        fs::create_dir_all(&extracted)
            .await
            .map_err(InstallerError::io(&extracted))?;

        match self.spec.format {
            ArchiveFormat::TarGz => fetch::unpack_tar_gz(&artifact, &extracted, ctx).await?,
            ArchiveFormat::Binary => {
                let binary = &self.spec.binaries[0];
                let dest = extracted.join(&binary.archive_path);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(InstallerError::io(parent))?;
                }
                fetch::copy_file(&artifact, &dest).await?;
            }
        }

        for binary in &self.spec.binaries {
            let path = extracted.join(&binary.archive_path);
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(InstallerError::MissingArtifact(path));
            }
        }
        Ok(())
    }

    async fn install(&self, ctx: &StepContext) -> Result<()> {
        fs::create_dir_all(&self.install_dir)
            .await
            .map_err(InstallerError::io(&self.install_dir))?;

        let extracted = self.extracted_dir();
        for binary in &self.spec.binaries {
            ctx.check()?;
            let from = extracted.join(&binary.archive_path);
            let to = self.target_path(binary);
            fetch::copy_file(&from, &to).await?;
            fs::set_permissions(&to, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(InstallerError::io(&to))?;
            info!(release = %self.spec.name, path = %to.display(), "Installed binary");
        }
        Ok(())
    }

    async fn cleanup(&self, _ctx: &StepContext) -> Result<()> {
        let extracted = self.extracted_dir();
        match fs::remove_dir_all(&extracted).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InstallerError::io(&extracted)(e)),
        }
    }

    async fn uninstall(&self, _ctx: &StepContext) -> Result<()> {
        for binary in &self.spec.binaries {
            let path = self.target_path(binary);
            remove_file_if_exists(&path).await?;
            info!(release = %self.spec.name, path = %path.display(), "Removed binary");
        }
        Ok(())
    }

    async fn is_configured(&self, _ctx: &StepContext) -> Result<bool> {
        for (path, contents, _) in self.rendered_files()? {
            match fs::read_to_string(&path).await {
                Ok(existing) if existing == contents => {}
                _ => return Ok(false),
            }
        }
        match self.unit()? {
            Some(unit) => self.systemd.is_current(&unit).await,
            None => Ok(true),
        }
    }

    async fn configure(&self, ctx: &StepContext) -> Result<()> {
        for (path, contents, mode) in self.rendered_files()? {
            write_file(&path, &contents, mode).await?;
            info!(release = %self.spec.name, path = %path.display(), "Wrote config file");
        }
        if let Some(unit) = self.unit()? {
            self.systemd.install_unit(&unit, ctx).await?;
        }
        Ok(())
    }

    async fn remove_configuration(&self, ctx: &StepContext) -> Result<()> {
        if let Some(unit) = self.unit()? {
            self.systemd.remove_unit(&unit, ctx).await?;
        }
        if let Some(config) = &self.spec.configuration {
            for file in &config.files {
                remove_file_if_exists(&file.path).await?;
            }
        }
        Ok(())
    }
}
