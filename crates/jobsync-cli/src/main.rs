use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobsync_sync::{PopulateOutcome, Reconciler, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Remote job listing cache")]
struct Cli {
    /// Serve remote data from canned files in DIR instead of the live API.
    #[arg(long, global = true, value_name = "DIR")]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web UI (default).
    Serve,
    /// Apply pending database migrations.
    Migrate,
    PopulateLocations,
    PopulateIndustries,
    /// Merge the RSS job feed into the cache.
    SyncFeed,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.fixtures {
        config.fixtures_dir = Some(dir);
    }

    let command = cli.command.unwrap_or(Commands::Serve);
    tracing::debug!(?command, database = %config.database_path.display(), "starting");

    match command {
        Commands::Serve => {
            jobsync_web::serve(&config, jobsync_web::port_from_env()).await?;
        }
        Commands::Migrate => {
            let store = jobsync_storage::Store::open(&config.database_path).await?;
            store.migrate().await?;
            println!("migrations applied to {}", config.database_path.display());
        }
        Commands::PopulateLocations => {
            let outcome = Reconciler::from_config(&config).await?.populate_locations_if_empty().await?;
            println!("locations: {}", describe(outcome));
        }
        Commands::PopulateIndustries => {
            let outcome = Reconciler::from_config(&config).await?.populate_industries_if_empty().await?;
            println!("industries: {}", describe(outcome));
        }
        Commands::SyncFeed => {
            let report = Reconciler::from_config(&config).await?.sync_feed_jobs().await?;
            println!(
                "feed sync complete: pass_id={} items={} inserted={} skipped={} new_locations={} new_industries={}",
                report.pass_id,
                report.feed_items,
                report.counts.jobs_inserted,
                report.counts.jobs_skipped,
                report.counts.locations_created,
                report.counts.industries_created
            );
        }
    }

    Ok(())
}

fn describe(outcome: PopulateOutcome) -> String {
    match outcome {
        PopulateOutcome::Populated { inserted, skipped } => format!("inserted={inserted} skipped={skipped}"),
        PopulateOutcome::AlreadyPopulated => "already populated".to_string(),
    }
}
