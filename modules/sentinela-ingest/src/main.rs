use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinela_common::{Config, FeedSource, QueryWindow};
use sentinela_ingest::Feeds;

#[derive(Parser)]
#[command(name = "sentinela", about = "Peru incident feed ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every scheduler, backfill and the proxy refresh until Ctrl-C
    Run,
    /// Run one update cycle for a source and print its report
    Update { source: FeedSource },
    /// Delete civil-defense rows that duplicate a provider identity
    Dedup,
    /// Print stored records within a time window as JSON
    Query {
        source: FeedSource,
        #[command(flatten)]
        window: WindowArgs,
    },
}

#[derive(Args)]
#[group(multiple = false)]
struct WindowArgs {
    #[arg(long)]
    hours: Option<u32>,
    #[arg(long)]
    days: Option<u32>,
}

impl WindowArgs {
    fn window(&self) -> QueryWindow {
        match (self.hours, self.days) {
            (Some(h), _) => QueryWindow::Hours(h),
            (_, Some(d)) => QueryWindow::Days(d),
            _ => QueryWindow::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sentinela=info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.log_redacted();

    let feeds = Feeds::from_config(&config).await?;

    match cli.command {
        Command::Run => {
            info!("Starting sentinela");
            feeds.start_all()?;
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            feeds.shutdown();
        }
        Command::Update { source } => {
            if source == FeedSource::FireIncidents {
                if let Err(e) = feeds.refresh_proxies().await {
                    warn!(error = %e, "Proxy refresh failed, scraping without proxies");
                }
            }
            let report = feeds.update_now(source).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Dedup => {
            let deleted = feeds.recover_identity_duplicates().await?;
            println!("{deleted} duplicate rows deleted");
        }
        Command::Query { source, window } => {
            let records = feeds.query(source, window.window()).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
