//! # Tally Storage Admin
//!
//! Maintenance tool for a local event store.
//!
//! ## Usage
//! ```bash
//! # Append 500 sample events (default)
//! cargo run -p tally-db --bin tally-admin -- seed
//!
//! # Custom amount, key/value engine
//! cargo run -p tally-db --bin tally-admin -- seed --count 2000 --engine kv
//!
//! # Storage metrics / forced compaction / wipe
//! cargo run -p tally-db --bin tally-admin -- stats --db ./data
//! cargo run -p tally-db --bin tally-admin -- compact
//! cargo run -p tally-db --bin tally-admin -- reset
//! ```
//!
//! Seeded events use the keys `seed-{i}`, so running `seed` twice
//! replays instead of duplicating.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tally_core::{AggregateRef, AppendOptions, CompactionSettings, StorageEngine, StoreSettings};
use tally_db::{open_adapter, CompactionManager, EventStore, TickOutcome};
use tracing_subscriber::EnvFilter;

/// Event types cycled through by `seed`, with their aggregate type.
const SAMPLE_TYPES: &[(&str, &str)] = &[
    ("sale.recorded", "sale"),
    ("stock.moved", "product"),
    ("shift.started", "shift"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut command: Option<String> = None;
    let mut count: usize = 500;
    let mut data_dir = PathBuf::from("./tally_data");
    let mut engine = StorageEngine::Auto;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(500);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--engine" | "-e" => {
                if i + 1 < args.len() {
                    engine = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if command.is_none() && !other.starts_with('-') => {
                command = Some(other.to_string());
            }
            _ => {}
        }
        i += 1;
    }

    let Some(command) = command else {
        print_help();
        return Ok(());
    };

    let settings = StoreSettings {
        engine,
        data_dir: Some(data_dir.clone()),
        ..Default::default()
    };

    println!("Tally Storage Admin");
    println!("===================");
    println!("Data dir: {}", data_dir.display());
    println!("Engine:   {}", settings.engine);
    println!();

    let adapter = open_adapter(&settings).await?;
    println!("✓ Opened {} ({})", adapter.name(), adapter.engine());

    match command.as_str() {
        "seed" => {
            let store = EventStore::open(Arc::clone(&adapter)).await?;
            let start = std::time::Instant::now();
            let mut created = 0;
            let mut replayed = 0;

            for i in 0..count {
                let (event_type, aggregate_type) = SAMPLE_TYPES[i % SAMPLE_TYPES.len()];
                let aggregate = AggregateRef::new(format!("{}-{}", aggregate_type, i / 10), aggregate_type);
                let options = AppendOptions::new()
                    .with_key(format!("seed-{}", i))
                    .with_aggregate(aggregate);

                let outcome = store
                    .append(event_type, json!({ "index": i, "amount": (i * 17) % 1000 }), options)
                    .await?;

                if outcome.is_new {
                    created += 1;
                } else {
                    replayed += 1;
                }

                if (i + 1) % 500 == 0 {
                    println!("  Appended {} events...", i + 1);
                }
            }

            let elapsed = start.elapsed();
            println!();
            println!("✓ {} new, {} replayed in {:?}", created, replayed, elapsed);
        }
        "stats" => {
            let metrics = adapter.metrics().await?;
            let usage = adapter.usage().await?;
            println!();
            println!("  Documents:     {}", metrics.document_count);
            println!("  Deleted:       {}", metrics.deleted_count);
            println!("  Update seq:    {}", metrics.update_seq);
            println!("  Size:          {} bytes", metrics.total_size);
            println!("  Usage:         {} bytes / {} items", usage.bytes, usage.items);
            println!("  Fragmentation: {:.1}%", metrics.fragmentation_ratio * 100.0);
        }
        "compact" => {
            let manager = CompactionManager::new(Arc::clone(&adapter), CompactionSettings::default());
            match manager.force_compaction().await {
                TickOutcome::Compacted(result) if result.success => {
                    println!(
                        "✓ Compacted: {} → {} bytes in {} ms",
                        result.bytes_before, result.bytes_after, result.duration_ms
                    );
                }
                TickOutcome::Compacted(result) => {
                    eprintln!(
                        "Compaction failed after {} attempts: {}",
                        result.attempts,
                        result.error.unwrap_or_default()
                    );
                }
                TickOutcome::Skipped(reason) => println!("⚠ Skipped: {:?}", reason),
            }
        }
        "reset" => {
            adapter.destroy().await?;
            println!("✓ All events and metadata removed");
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
        }
    }

    Ok(())
}

fn print_help() {
    println!("Tally Storage Admin");
    println!();
    println!("Usage: tally-admin <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  seed      Append sample events");
    println!("  stats     Print storage metrics");
    println!("  compact   Run compaction now");
    println!("  reset     Remove every event and metadata entry");
    println!();
    println!("Options:");
    println!("  -c, --count <N>       Events to append with seed (default: 500)");
    println!("  -d, --db <DIR>        Data directory (default: ./tally_data)");
    println!("  -e, --engine <NAME>   auto | sqlite | key_value (default: auto)");
    println!("  -h, --help            Show this help message");
}
