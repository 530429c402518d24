mod cmd;
mod config;

use clap::{Parser, Subcommand};
use cmd::install::{run_install, InstallArgs};
use cmd::plan::{run_plan, PlanArgs};
use color_eyre::eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Provision cluster nodes from a node file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install, configure and upgrade everything in the node file
    Install(InstallArgs),

    /// Show the steps install would run
    Plan(PlanArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nodeforge={level},nodeforge_workflow={level},nodeforge_installer={level},nodeforge_resources={level},kube=warn,hyper=warn,reqwest=warn,rustls=warn,h2=warn,tower=warn"
        ))
    });
    let stderr = std::io::stderr;
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    match cli.command {
        Commands::Install(args) => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Ctrl+C received, cancelling and rolling back");
                        signal.cancel();
                    }
                    Err(e) => debug!(error = %e, "Cannot listen for Ctrl+C"),
                }
            });

            match run_install(args, shutdown).await {
                Ok(true) => {}
                Ok(false) => std::process::exit(1),
                Err(e) => {
                    error!("Install failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Plan(args) => {
            if let Err(e) = run_plan(args) {
                error!("Plan failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
