//! nodeforge Cluster Resources
//!
//! Components that run on the cluster are deployed as Helm charts. Each
//! one is provisioned in two phases, both built on
//! [`nodeforge_workflow`]:
//!
//! ```text
//! install:  storage dirs ─▶ namespace ─▶ volumes ─▶ chart ─▶ annotate ─▶ ready
//! upgrade:  up to date?  ─▶ direct upgrade | migration workflow
//! ```
//!
//! Steps talk to the cluster through the [`ResourceManager`] trait.
//! [`ClusterManager`] implements it with kube and the `helm` CLI;
//! [`MemoryResourceManager`] keeps the cluster in memory for tests.

pub mod cluster;
pub mod component;
pub mod error;
pub mod helm;
pub mod manager;
pub mod memory;
pub mod steps;
pub mod upgrade;

pub use cluster::ClusterManager;
pub use component::{ChartComponent, ServiceAnnotations};
pub use error::{ResourceError, Result};
pub use helm::HelmCli;
pub use manager::{values_equal, ChartSpec, ReadinessTarget, ReleaseInfo, ResourceManager, VolumeSpec};
pub use memory::MemoryResourceManager;
pub use steps::{
    AnnotateServiceStep, ChartInstallStep, ManagerProvider, NamespaceStep, StorageDirsStep,
    VolumesStep, WaitReadyStep,
};
pub use upgrade::{
    same_version, split_chart_version, ChartVersion, MigrationPlan, ReinstallMigration,
    UninstallReleaseStep, UpgradeStep,
};
