use crate::config::{NodeConfig, DEFAULT_CONFIG};
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use nodeforge_resources::ClusterManager;
use nodeforge_workflow::{Report, Status, Step, StepContext};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Node file describing the components to provision
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Print the full report as JSON instead of a summary
    #[arg(long)]
    pub json: bool,

    /// Give up after this many seconds; completed work is rolled back
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

/// Provision the node; returns whether the run succeeded
pub async fn run_install(args: InstallArgs, shutdown: CancellationToken) -> Result<bool> {
    let config = NodeConfig::load(&args.config)?;
    let workflow = super::node_workflow(&config, &ClusterManager::provider())?;
    info!(node = %config.node.name, steps = workflow.len(), "Provisioning node");

    let mut ctx = StepContext::new().with_cancellation(shutdown);
    if let Some(secs) = args.timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }

    let report = workflow.execute(&ctx).await;
    if args.json {
        let body = serde_json::to_string_pretty(&report).wrap_err("failed to encode report")?;
        println!("{body}");
    } else {
        print!("{}", render_report(&report));
    }

    match report.error() {
        None => {
            info!(node = %config.node.name, "Node provisioned");
            Ok(true)
        }
        Some(e) => {
            error!(node = %config.node.name, error = %e, "Provisioning failed");
            if let Some(hint) = e.hint() {
                eprintln!("hint: {hint}");
            }
            Ok(false)
        }
    }
}

fn marker(status: Status) -> &'static str {
    match status {
        Status::Success => "ok",
        Status::Skipped => "--",
        Status::Failed => "!!",
    }
}

/// Indented outcome tree, rollbacks shown under the step they undid
pub fn render_report(report: &Report) -> String {
    let mut out = String::new();
    render_into(&mut out, report, 0);
    out
}

fn render_into(out: &mut String, report: &Report, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = write!(out, "{indent}[{}] {}", marker(report.status()), report.id());
    if let Some(duration) = report.duration() {
        let _ = write!(out, " ({:.1}s)", duration.as_secs_f64());
    }
    out.push('\n');
    if let Some(e) = report.error() {
        let _ = writeln!(out, "{indent}     {e}");
    }
    for child in report.step_reports() {
        render_into(out, child, depth + 1);
    }
    if let Some(rollback) = report.rollback() {
        let _ = writeln!(
            out,
            "{indent}  rollback [{}]",
            marker(rollback.status())
        );
        if let Some(e) = rollback.error() {
            let _ = writeln!(out, "{indent}     {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_workflow::{ErrorKind, StepError};

    #[test]
    fn test_render_report() {
        let report = Report::failed(
            "worker-1",
            StepError::new(ErrorKind::Installation, "chart failed"),
        )
        .with_step_reports(vec![
            Report::skipped("containerd-lifecycle"),
            Report::failed(
                "registry-chart",
                StepError::new(ErrorKind::Installation, "chart failed"),
            )
            .with_rollback(Report::success("registry-chart")),
        ]);

        let rendered = render_report(&report);
        assert_eq!(
            rendered,
            "[!!] worker-1\n     installation error: chart failed\n  [--] containerd-lifecycle\n  [!!] registry-chart\n       installation error: chart failed\n    rollback [ok]\n"
        );
    }
}
