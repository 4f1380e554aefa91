// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spindle ingest service CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the consumer against a local broker
//! spindle-ingest --db spindle_readings.db
//!
//! # Inspect what has been stored
//! spindle-ingest --db spindle_readings.db stats
//! spindle-ingest --db spindle_readings.db list
//! spindle-ingest --db spindle_readings.db query cnc-07 \
//!     --from 2026-08-01T00:00:00Z --to 2026-08-02T00:00:00Z
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use spindle_ingest::{IngestConfig, IngestConsumer, ReadingStore, SqliteStore};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "spindle-ingest")]
#[command(about = "Spindle ingest service - persist edge telemetry", long_about = None)]
#[command(version)]
struct Args {
    /// Database path (SQLite file)
    #[arg(short, long, default_value = "spindle_readings.db")]
    db: String,

    /// Broker URL
    #[arg(short, long, default_value = "nats://127.0.0.1:4222")]
    url: String,

    /// Stream name
    #[arg(long, default_value = "TELEMETRY")]
    stream: String,

    /// Subject prefix (stream listens on `{prefix}.>`)
    #[arg(long, default_value = "TELEMETRY")]
    subject_prefix: String,

    /// Durable consumer name
    #[arg(long, default_value = "spindle-ingest")]
    durable: String,

    /// Maximum messages per fetch
    #[arg(long, default_value_t = 64)]
    max_batch: usize,

    /// Maximum wait per fetch in seconds
    #[arg(long, default_value_t = 5)]
    max_wait: u64,

    /// Redelivery delay after a negative acknowledgment, in seconds
    #[arg(long, default_value_t = 5)]
    nak_delay: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show store statistics
    Stats,
    /// List machines with stored readings
    List,
    /// Query readings for a machine within a time range
    Query {
        /// Machine identifier
        machine: String,

        /// Range start (RFC 3339; default: epoch)
        #[arg(long)]
        from: Option<String>,

        /// Range end (RFC 3339; default: now)
        #[arg(long)]
        to: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let store = SqliteStore::new(&args.db)
        .with_context(|| format!("opening reading store at {}", args.db))?;

    if let Some(command) = args.command {
        return handle_command(command, &store);
    }

    tracing::info!("Spindle ingest service starting");
    tracing::info!("  Database: {}", args.db);
    tracing::info!("  Stream: {} on {}", args.stream, args.url);
    tracing::info!("  Durable: {}", args.durable);

    let config = IngestConfig::builder()
        .db_path(args.db)
        .url(args.url)
        .stream(args.stream)
        .subject_prefix(args.subject_prefix)
        .durable_name(args.durable)
        .max_batch(args.max_batch)
        .max_wait_secs(args.max_wait)
        .nak_delay_secs(args.nak_delay)
        .build();

    let consumer = IngestConsumer::new(config, Arc::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    consumer.run(shutdown_rx).await?;

    let stats = consumer.stats();
    tracing::info!(
        "Ingest stopped: {} messages, {} stored, {} duplicates, {} terms, {} naks",
        stats.messages,
        stats.readings_stored,
        stats.duplicates,
        stats.terms,
        stats.naks
    );

    Ok(())
}

fn handle_command(command: Commands, store: &SqliteStore) -> Result<()> {
    match command {
        Commands::Stats => {
            println!("Total readings stored: {}", store.count()?);
            for machine in store.machine_ids()? {
                let latest = store.latest_sequence(&machine)?.unwrap_or(0);
                println!("  {} (latest sequence {})", machine, latest);
            }
        }
        Commands::List => {
            println!("Machines:");
            for machine in store.machine_ids()? {
                println!("  {}", machine);
            }
        }
        Commands::Query { machine, from, to } => {
            let from = parse_bound(from.as_deref())?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            let to = parse_bound(to.as_deref())?.unwrap_or_else(Utc::now);

            let readings = store.query_range(&machine, from, to)?;
            println!("{} reading(s) for '{}':", readings.len(), machine);
            for reading in &readings {
                println!(
                    "  seq={} ts={} state={} spindle={:.0}rpm load={:.1}%",
                    reading.sequence,
                    reading.timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
                    reading.telemetry.machine_state,
                    reading.telemetry.spindle_speed,
                    reading.telemetry.spindle_load_percent
                );
            }
        }
    }

    Ok(())
}

fn parse_bound(bound: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    bound
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("invalid RFC 3339 timestamp: {s}"))
        })
        .transpose()
}
