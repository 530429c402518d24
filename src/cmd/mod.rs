pub mod install;
pub mod plan;

use crate::config::NodeConfig;
use color_eyre::eyre::{Result, WrapErr};
use nodeforge_installer::{
    lifecycle_workflow, CommandRunner, ReleaseInstallable, SelfInstallable, TokioCommandRunner,
};
use nodeforge_resources::ManagerProvider;
use nodeforge_workflow::Workflow;
use std::sync::Arc;

/// Everything the node file describes, as one workflow named after the node
///
/// Order: the nodeforge binary itself, each `[[release]]`, then each
/// `[[chart]]` as its install workflow followed by its upgrade step.
pub fn node_workflow(config: &NodeConfig, manager: &ManagerProvider) -> Result<Workflow> {
    let layout = config.layout();
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let mut builder = Workflow::builder(&config.node.name);

    if let Some(section) = &config.self_install {
        let mut target = SelfInstallable::new(&section.target, &layout.unit_dir, runner.clone());
        if let Some(unit) = &section.unit {
            target = target.with_unit(unit.clone());
        }
        builder = builder.step(lifecycle_workflow(Arc::new(target))?);
    }

    for spec in &config.releases {
        let release = ReleaseInstallable::new(spec.clone(), &layout, runner.clone())
            .wrap_err_with(|| format!("invalid release '{}'", spec.name))?;
        builder = builder.step(lifecycle_workflow(Arc::new(release))?);
    }

    for chart in &config.charts {
        builder = builder
            .step(chart.install_workflow(manager)?)
            .step(chart.upgrade_step(manager));
    }

    Ok(builder.build()?)
}
