use clap::{Parser, Subcommand};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tally_core::model::InboundMessage;
use tally_engine::Engine;
use tally_engine::catalog::{HttpCatalog, NutritionCatalog, StaticCatalog};
use tally_engine::clock::SystemClock;
use tally_engine::config::{CatalogConfig, EngineConfig};
use tally_engine::sender::TracingSender;
use tally_engine::store::{MemoryStore, PgStore, Store};

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Message-driven health tracker: meals, migraine/fasting episodes, meds, daily facts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one inbound message and print the reply
    Send {
        /// Message text, exactly as a user would send it
        text: String,
        /// Delivery id for idempotency; redeliveries with the same id
        /// replay instead of double-counting. Defaults to a fresh UUID.
        #[arg(long)]
        event_id: Option<String>,
        /// Wrap in a dry run: the full pipeline executes, nothing persists
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one scheduled fact-delivery tick
    Tick,
    /// Add a fact to the daily delivery pool
    FactAdd {
        text: String,
        /// Tags for `/fact <tag>` and the settings tag filter (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await
                .expect("Failed to connect to database");
            sqlx::migrate!("../migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            with_catalog(PgStore::new(pool), config, cli.command).await;
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using an in-memory store (nothing survives exit)");
            with_catalog(MemoryStore::new(), config, cli.command).await;
        }
    }
}

async fn with_catalog<S: Store>(store: S, config: EngineConfig, command: Commands) {
    match CatalogConfig::from_env() {
        Some(catalog_config) => {
            let catalog = HttpCatalog::new(catalog_config).expect("Failed to build catalog client");
            run(store, catalog, config, command).await;
        }
        None => {
            tracing::warn!("no catalog credentials set, resolving from overrides only");
            run(store, StaticCatalog::new(), config, command).await;
        }
    }
}

async fn run<S: Store, C: NutritionCatalog>(
    store: S,
    catalog: C,
    config: EngineConfig,
    command: Commands,
) {
    let user_id = config.user_id.clone();
    let clock = SystemClock::new(config.timezone);
    let engine = Engine::new(store, catalog, clock, TracingSender, config);

    match command {
        Commands::Send {
            text,
            event_id,
            dry_run,
        } => {
            let text = if dry_run { format!("/test {text}") } else { text };
            let msg = InboundMessage {
                event_id: event_id.unwrap_or_else(|| Uuid::now_v7().to_string()),
                user_id,
                timestamp: Utc::now(),
                text,
            };
            println!("{}", engine.reply(&msg).await);
        }
        Commands::Tick => match engine.tick().await {
            Ok(report) => {
                println!(
                    "tick: sent {}, skipped {}, failed {}",
                    report.sent, report.skipped, report.failed
                );
            }
            Err(err) => {
                eprintln!("tick failed: {err}");
                std::process::exit(1);
            }
        },
        Commands::FactAdd { text, tags } => match engine.add_fact(&text, tags).await {
            Ok(fact) => println!("saved fact {} ({} tags)", fact.id, fact.tags.len()),
            Err(err) => {
                eprintln!("could not save fact: {err}");
                std::process::exit(1);
            }
        },
    }
}
