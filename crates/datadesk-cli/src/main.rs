use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use datadesk_charts::ChartTemplate;
use datadesk_sync::{maybe_build_scheduler, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "datadesk")]
#[command(about = "Civic open-data to chart sync pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled job once and exit.
    Sync {
        /// Process a single job by its registry name.
        #[arg(long)]
        only: Option<String>,
    },
    /// Stay resident and run on the configured cron slots.
    Schedule,
    /// Capture a chart's visual design into a template file.
    Template {
        chart_id: String,
        #[arg(long, default_value = "map_template.json")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { only: None }) {
        Commands::Sync { only } => {
            let pipeline = SyncPipeline::from_env()?;
            let summary = match only {
                Some(name) => pipeline.run_only(&name).await?,
                None => pipeline.run_once().await?,
            };
            println!("{}", summary.render_text());
            if !summary.all_succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_env()?);
            let mut config = pipeline.config().clone();
            config.scheduler_enabled = true;
            let mut scheduler = maybe_build_scheduler(pipeline, &config)
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await.context("starting scheduler")?;
            println!(
                "scheduler running (crons: {}, {}); ctrl-c to stop",
                config.sync_cron_1, config.sync_cron_2
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Template { chart_id, out } => {
            let pipeline = SyncPipeline::from_env()?;
            let template = ChartTemplate::capture(pipeline.charts().as_ref(), &chart_id).await?;
            template.save(&out)?;
            println!("saved template from {chart_id} to {}", out.display());
        }
    }

    Ok(())
}
