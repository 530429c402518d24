use crate::config::{NodeConfig, DEFAULT_CONFIG};
use clap::Args;
use color_eyre::eyre::Result;
use nodeforge_resources::ClusterManager;
use nodeforge_workflow::Step;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Node file describing the components to provision
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

/// Print the steps `install` would run, without running them
pub fn run_plan(args: PlanArgs) -> Result<()> {
    let config = NodeConfig::load(&args.config)?;
    let workflow = super::node_workflow(&config, &ClusterManager::provider())?;
    print!("{}", render_plan(&workflow));
    Ok(())
}

pub fn render_plan(step: &dyn Step) -> String {
    let mut out = String::new();
    render_into(&mut out, step, 0);
    out
}

fn render_into(out: &mut String, step: &dyn Step, depth: usize) {
    let description = step.description();
    out.push_str(&"  ".repeat(depth));
    out.push_str(step.id());
    if description != step.id() {
        out.push_str(": ");
        out.push_str(&description);
    }
    out.push('\n');
    for child in step.children() {
        render_into(out, child, depth + 1);
    }
}
