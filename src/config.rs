//! Node file
//!
//! ```toml
//! [node]
//! name = "worker-1"
//!
//! [[release]]
//! name = "containerd"
//! ...
//!
//! [[chart]]
//! name = "cert-manager"
//! ...
//! ```

use color_eyre::eyre::{bail, Result, WrapErr};
use nodeforge_installer::{Layout, ReleaseSpec, UnitSpec, SELF_TARGET};
use nodeforge_resources::ChartComponent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "/etc/nodeforge/node.toml";

fn default_self_target() -> PathBuf {
    PathBuf::from(SELF_TARGET)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub name: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub unit_dir: Option<PathBuf>,
}

/// Install the nodeforge binary itself, optionally as a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelfInstallSection {
    #[serde(default = "default_self_target")]
    pub target: PathBuf,
    #[serde(default)]
    pub unit: Option<UnitSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub self_install: Option<SelfInstallSection>,
    #[serde(default, rename = "release")]
    pub releases: Vec<ReleaseSpec>,
    #[serde(default, rename = "chart")]
    pub charts: Vec<ChartComponent>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read node file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse node file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            bail!("node.name must not be empty");
        }

        let mut names = BTreeSet::new();
        for release in &self.releases {
            release.validate()?;
            if !names.insert(release.name.as_str()) {
                bail!("release '{}' is listed twice", release.name);
            }
        }
        for chart in &self.charts {
            chart.validate()?;
            if !names.insert(chart.name.as_str()) {
                bail!("component '{}' is listed twice", chart.name);
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        let defaults = Layout::default();
        Layout {
            install_dir: self
                .node
                .install_dir
                .clone()
                .unwrap_or(defaults.install_dir),
            work_dir: self.node.work_dir.clone().unwrap_or(defaults.work_dir),
            unit_dir: self.node.unit_dir.clone().unwrap_or(defaults.unit_dir),
        }
    }
}
