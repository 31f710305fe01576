//! Command-line entry point for `footfall-pipeline`.
//!
//! Orchestrates the startup sequence shared by every command:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Connecting the warehouse backend (Postgres pool or Supabase REST)
//!
//! and then runs one command:
//! - `collect` – poll every eligible sensor once
//! - `aggregate-hourly [--date]` / `aggregate-daily [--date]` – rebuild rollups
//! - `migrate` – create the warehouse schema (Postgres backend only)
//! - `serve` – expose the jobs as cron-triggered HTTP routes
//!
//! # Environment Variables
//! See [`footfall_pipeline::config::load_from_env`] for the full list. Logging:
//! - `LOG_LEVEL` (optional) – log verbosity when `RUST_LOG` is unset (default: `info`)
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – force ANSI colours on or off
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use footfall_pipeline::aggregate::{DailyAggregator, HourlyAggregator, RunDate};
use footfall_pipeline::config::{self, StoreConfig};
use footfall_pipeline::routes::{self, AppState};
use footfall_pipeline::store::{self, PgStore};
use footfall_pipeline::{schema, Pipeline};

// ---

#[derive(Parser)]
#[command(name = "footfall-pipeline", version, about = "Foot-traffic sensor collection and analytics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every eligible sensor once and store its readings
    Collect,
    /// Rebuild hourly analytics for a store-local date (default: each store's local today)
    AggregateHourly {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Rebuild daily analytics for a store-local date (default: each store's local yesterday)
    AggregateDaily {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create or update the warehouse schema
    Migrate,
    /// Serve `/health` and the cron routes
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_from_env()?;
    cfg.log_config();

    match cli.command {
        Command::Collect => {
            let store = store::connect(&cfg.store).await?;
            let pipeline = Pipeline::from_config(&cfg, store)?;
            let summary = pipeline.collect(Utc::now()).await?;
            print_json(&summary)?;
        }
        Command::AggregateHourly { date } => {
            let store = store::connect(&cfg.store).await?;
            let target = RunDate::or_default(date, Utc::now());
            let summary = HourlyAggregator::new(store).run(target).await?;
            print_json(&summary)?;
        }
        Command::AggregateDaily { date } => {
            let store = store::connect(&cfg.store).await?;
            let target = RunDate::or_default(date, Utc::now());
            let summary = DailyAggregator::new(store).run(target).await?;
            print_json(&summary)?;
        }
        Command::Migrate => {
            let StoreConfig::Postgres { db_url, pool_max } = &cfg.store else {
                return Err(anyhow!("migrate needs DATABASE_URL; the REST backend cannot run DDL"));
            };
            let store = PgStore::connect(db_url, *pool_max).await?;
            schema::create_schema(store.pool()).await?;
        }
        Command::Serve => {
            let cron_secret = cfg.require_cron_secret()?;
            let store = store::connect(&cfg.store).await?;
            let pipeline = Pipeline::from_config(&cfg, store.clone())?;

            // Build app from routes gateway (EMBP)
            let app: Router = routes::router(AppState {
                store,
                pipeline: Arc::new(pipeline),
                cron_secret: Arc::from(cron_secret),
            });

            tracing::info!("Listening on {}", cfg.bind_addr);
            let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
                .await
                .with_context(|| format!("Failed to bind {}", cfg.bind_addr))?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY on stderr
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else the `LOG_LEVEL` env var
///
/// Logs go to stderr so command summaries on stdout stay machine-readable.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
