use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sjs_core::ExportWindow;
use sjs_sync::{ExportFormat, ExportOptions, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sjs-cli")]
#[command(about = "Seasonal jobs scraper: feed ingestion, enrichment and exports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the job feed and upsert listings.
    IngestFeed {
        /// Stop after examining this many feed entries.
        #[arg(long)]
        max_count: Option<usize>,
        /// Only insert new listings; leave existing ones untouched.
        #[arg(long)]
        skip_update: bool,
    },
    /// Fetch search data and job order PDFs for unenriched listings.
    EnrichListings {
        #[arg(long, default_value_t = 1)]
        max_count: usize,
    },
    /// Write listings to a CSV or JSON file under the media root.
    ExportListings {
        /// Restrict to listings last seen in this window (day, week, month, year).
        #[arg(long)]
        last: Option<ExportWindow>,
        /// Write to job-listings-latest.* instead of a dated file.
        #[arg(long)]
        fixed_destination: bool,
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Print listing and backlog counts as JSON.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command {
        Commands::IngestFeed {
            max_count,
            skip_update,
        } => {
            let summary = sjs_sync::ingest_feed(&config, max_count, skip_update).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::EnrichListings { max_count } => {
            let summary = sjs_sync::enrich_listings(&config, max_count).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::ExportListings {
            last,
            fixed_destination,
            json,
        } => {
            let options = ExportOptions {
                window: last,
                format: if json { ExportFormat::Json } else { ExportFormat::Csv },
                fixed_destination,
            };
            let summary = sjs_sync::export_listings(&config, &options).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Migrate => {
            sjs_sync::migrate(&config).await?;
            tracing::info!(database = %config.database_url, "migrations applied");
        }
        Commands::Stats => {
            let db = config.open_database().await?;
            let stats = sjs_sync::listing_stats(&db).await?;
            println!("{}", serde_json::to_string(&stats)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn enrich_defaults_to_one_listing() {
        let cli = Cli::try_parse_from(["sjs-cli", "enrich-listings"]).unwrap();
        assert!(matches!(cli.command, Commands::EnrichListings { max_count: 1 }));
    }

    #[test]
    fn export_parses_window_and_flags() {
        let cli = Cli::try_parse_from([
            "sjs-cli",
            "export-listings",
            "--last",
            "month",
            "--json",
            "--fixed-destination",
        ])
        .unwrap();
        match cli.command {
            Commands::ExportListings {
                last,
                fixed_destination,
                json,
            } => {
                assert_eq!(last, Some(ExportWindow::Month));
                assert!(fixed_destination);
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["sjs-cli", "export-listings", "--last", "decade"]).is_err());
    }
}
