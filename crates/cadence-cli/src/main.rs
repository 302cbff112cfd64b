use std::sync::Arc;

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_scheduler::{
    maintenance::MaintenanceHandler, HandlerRegistry, HandlerResolver, JobStore, SchedulerEngine,
};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(name = "cadence", version, about = "Persistence-backed job scheduler")]
struct CliArgs {
    /// Path to cadence.toml. Falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml.
    #[clap(long, global = true)]
    pub config: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler for one bounded window, then exit.
    ///
    /// Meant to be relaunched by a timer or supervisor.
    Cron {
        /// Skip the periodic task discovery pass.
        #[clap(long)]
        no_discovery: bool,

        /// Override scheduler.window_secs.
        #[clap(long)]
        window_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = CliArgs::parse();
    let mut config = CadenceConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::Cron {
            no_discovery,
            window_secs,
        } => {
            if no_discovery {
                config.scheduler.discover_on_start = false;
            }
            if let Some(secs) = window_secs {
                config.scheduler.window_secs = secs;
            }
            config.validate()?;
            run_cron(config).await
        }
    }
}

async fn run_cron(config: CadenceConfig) -> anyhow::Result<()> {
    let database = config.require_database()?;
    database
        .ensure_parent_dir()
        .with_context(|| format!("creating directory for {}", database.path))?;
    info!(path = %database.path, "waiting for job store");

    let maintenance = config.maintenance.clone();
    let engine = SchedulerEngine::connect(&config, move |store| build_handlers(store, &maintenance))
        .await
        .context("starting scheduler")?;

    match engine.run().await {
        Ok(summary) => {
            info!(
                processed = summary.processed,
                elapsed_secs = summary.elapsed.as_secs(),
                "scheduler exiting"
            );
            Ok(())
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "scheduler stopped by error");
            Err(e.into())
        }
    }
}

/// Every handler this binary can dispatch to.
fn build_handlers(
    store: &Arc<JobStore>,
    maintenance: &cadence_core::config::MaintenanceConfig,
) -> Arc<dyn HandlerResolver> {
    let mut registry = HandlerRegistry::new();
    if maintenance.enabled {
        registry.register(Arc::new(MaintenanceHandler::new(
            Arc::clone(store),
            maintenance.schedule.clone(),
            maintenance.failed_retention_days,
        )));
    }
    info!(handlers = registry.len(), "handler registry built");
    Arc::new(registry)
}
