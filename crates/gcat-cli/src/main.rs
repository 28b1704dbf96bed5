use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use gcat_core::CatalogId;
use gcat_sync::{
    export_versions_parquet, maybe_build_scheduler, IngestPipeline, PgWarehouse, PipelineConfig,
    RunParams,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gcat-cli")]
#[command(about = "Games catalog ingestion with SCD2 history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass.
    Run {
        /// Load date, defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Fetch every candidate instead of new ids plus a recheck sample.
        #[arg(long)]
        initial: bool,
        #[arg(long)]
        max_apps: Option<usize>,
    },
    /// Apply database migrations (requires DATABASE_URL).
    Migrate,
    /// Run the cron trigger until interrupted.
    Schedule,
    /// Write the versioned store to parquet.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print every version of one app id.
    History {
        #[arg(long)]
        id: u64,
    },
}

fn init_tracing() {
    let json = std::env::var("GCAT_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading configuration")?;

    let command = cli.command.unwrap_or(Commands::Run {
        date: None,
        initial: false,
        max_apps: None,
    });

    match command {
        Commands::Run {
            date,
            initial,
            max_apps,
        } => {
            let pipeline = IngestPipeline::from_config(&config).await?;
            let params = RunParams {
                run_date: date.unwrap_or_else(|| Utc::now().date_naive()),
                is_initial_load: initial,
                max_apps,
            };
            let summary = pipeline.run(params).await.context("ingest run failed")?;
            println!(
                "run complete: run_id={} outcome={:?} work_set={} fetched={} failed={} inserted={} superseded={} unchanged={}",
                summary.run_id,
                summary.outcome,
                summary.work_set,
                summary.fetched,
                summary.failed,
                summary.merge.inserted,
                summary.merge.superseded,
                summary.merge.unchanged
            );
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set; the snapshot warehouse needs no migrations");
            };
            let warehouse = PgWarehouse::connect(url).await.context("connecting to database")?;
            warehouse.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(IngestPipeline::from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, &config).await? else {
                bail!("scheduler disabled; set GCAT_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Export { out } => {
            let pipeline = IngestPipeline::from_config(&config).await?;
            let entries = pipeline.versions().all_entries().await?;
            let out = out.unwrap_or_else(|| config.data_dir.join("export"));
            let manifest = export_versions_parquet(&entries, &out)?;
            for file in &manifest.files {
                println!("{} rows={} sha256={} -> {}", file.name, file.rows, file.sha256, out.join(&file.path).display());
            }
        }
        Commands::History { id } => {
            let id = CatalogId::new(id).context("app id must be positive")?;
            let pipeline = IngestPipeline::from_config(&config).await?;
            let versions = pipeline.versions().history(id).await?;
            if versions.is_empty() {
                println!("no versions for app {id}");
            }
            for entry in versions {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }

    Ok(())
}
