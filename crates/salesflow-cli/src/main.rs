use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use salesflow_core::{Clock, SystemClock};
use salesflow_storage::PgSalesStore;
use salesflow_sync::{
    daily_report_markdown, load_source_registry, maybe_build_scheduler, pipeline_from_config,
    seed_sources, SyncConfig,
};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "salesflow-cli")]
#[command(about = "SalesFlow sales ETL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ETL pipeline once for a source
    Etl {
        /// Registered source name (defaults to SALESFLOW_SOURCE or mock_api)
        #[arg(long)]
        source: Option<String>,
        /// First day to extract, YYYY-MM-DD
        #[arg(long)]
        start_date: Option<String>,
        /// Last day to extract, YYYY-MM-DD
        #[arg(long)]
        end_date: Option<String>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Register the sources listed in the registry file
    SeedSources {
        #[arg(long)]
        registry: Option<PathBuf>,
    },
    /// Run active sources on the configured cron schedule until interrupted
    Schedule,
    /// Print a markdown sales digest
    Report {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Etl {
        source: None,
        start_date: None,
        end_date: None,
        json: false,
    }))
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = SyncConfig::from_env();
    match command {
        Commands::Etl {
            source,
            start_date,
            end_date,
            json,
        } => {
            let pipeline = pipeline_from_config(&config).await?;
            let source = source.unwrap_or_else(|| config.source_name.clone());
            let summary = pipeline
                .run(&source, start_date.as_deref(), end_date.as_deref())
                .await
                .with_context(|| format!("ETL failed for source {source}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "ETL completed successfully for source {}: run_id={} range={} sales_created={} metrics_recomputed={}",
                    summary.source,
                    summary.run_id,
                    summary.range,
                    summary.created_sales,
                    summary.metrics_recomputed
                );
            }
        }
        Commands::Migrate => {
            let store = PgSalesStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::SeedSources { registry } => {
            let path = registry.unwrap_or_else(|| config.registry_path());
            let registry = load_source_registry(&path)?;
            let store = PgSalesStore::connect(&config.database_url).await?;
            let seeded = seed_sources(&store, &registry).await?;
            println!("registered {} source(s) from {}", seeded.len(), path.display());
        }
        Commands::Schedule => {
            let registry = load_source_registry(&config.registry_path())?;
            let names = registry
                .sources
                .iter()
                .filter(|s| s.is_active)
                .map(|s| s.name.clone())
                .collect();
            let pipeline = Arc::new(pipeline_from_config(&config).await?);
            let Some(sched) = maybe_build_scheduler(pipeline, &config, names).await? else {
                error!("scheduler disabled; set SALESFLOW_SCHEDULER_ENABLED=true");
                anyhow::bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
        Commands::Report { days, top } => {
            let store = PgSalesStore::connect(&config.database_url).await?;
            let today = SystemClock.today();
            println!("{}", daily_report_markdown(&store, today, days, top).await?);
        }
    }
    Ok(())
}
