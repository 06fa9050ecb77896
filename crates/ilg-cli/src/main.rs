use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ilg_crm::{CrmClient, CrmConfig};
use ilg_pipeline::{Crawler, CrmSyncer, Enricher, PipelineConfig};
use ilg_store::{LeadStore, PgStore};
use ilg_web::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ilg-cli")]
#[command(about = "Indeed lead generator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl today's postings for all configured search terms.
    Crawl,
    /// Enrich unenriched leads from their company profile pages.
    Enrich,
    /// Push local leads into Close CRM.
    SyncCrm,
    /// Delete every stored lead.
    Purge,
    /// Run the JSON API server (default).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    store.ensure_schema().await.context("ensuring schema")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Crawl => {
            let crawler = Crawler::new(config, store.clone(), store);
            let summary = crawler.run().await?;
            println!(
                "crawl complete: attempts={} terms={} jobs_added={}",
                summary.attempts, summary.terms_completed, summary.jobs_added
            );
        }
        Commands::Enrich => {
            let enricher = Enricher::new(config, store);
            let summary = enricher.run().await?;
            println!(
                "enrichment complete: enriched={} skipped={} failed={} elapsed={:.2}s",
                summary.enriched, summary.skipped, summary.failed, summary.elapsed_secs
            );
        }
        Commands::SyncCrm => {
            let api_key = config
                .close_api_key
                .clone()
                .context("CLOSE_API_KEY is not configured")?;
            let client = CrmClient::new(CrmConfig::new(api_key))?;
            let syncer = CrmSyncer::new(client, store);
            let summary = syncer.run().await?;
            println!(
                "crm sync complete: leads={} matches={} failed={}",
                summary.total_leads,
                summary.matches.len(),
                summary.failed
            );
        }
        Commands::Purge => {
            let deleted = store.delete_all().await?;
            println!("deleted {deleted} leads");
        }
        Commands::Serve => {
            let state = AppState::new(config, store.clone(), store);
            ilg_web::serve(state).await?;
        }
    }

    Ok(())
}
