// Demonstration and throughput benchmark for the pantheon dispatch engine

use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use pantheon::{Engine, EngineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Push offerings to two gods and measure how fast the engine drains them.
#[derive(Parser, Debug)]
#[command(name = "pantheon-bench", version, about)]
struct Args {
    /// Offerings pushed to each god before the benchmark starts
    #[arg(long, default_value_t = 10)]
    initial: u32,

    /// Offerings pushed to the busy god during the benchmark
    #[arg(long, default_value_t = 1_000_000)]
    events: u32,

    /// Busy-loop iterations performed by the busy god's handler
    #[arg(long, default_value_t = 100_000_000)]
    spin: u64,

    /// How long to let the engine drain before measuring, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    settle_ms: u64,

    /// Print the final counters as JSON instead of a summary line
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone)]
struct Offering {
    id: u32,
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pantheon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    tracing::info!(?config, "configuration loaded");

    let engine: Engine<Offering> = Engine::builder()
        .with_config(config)
        .start()
        .context("Failed to start engine")?;

    let spin = args.spin;
    engine.register("God_1", move |offering: &Offering| {
        println!(
            "[God_1] Processing event {}: {}",
            offering.id, offering.message
        );
        let mut acc = 0u64;
        for i in 0..spin {
            acc = black_box(acc.wrapping_add(i));
        }
        black_box(acc);
        Ok(())
    });
    engine.register("God_2", |offering: &Offering| {
        println!(
            "[God_2] Processing event {}: {}",
            offering.id, offering.message
        );
        Ok(())
    });

    for id in 0..args.initial {
        engine.push(
            "God_1",
            Offering {
                id,
                message: "Offering to God 1".to_string(),
            },
        );
        engine.push(
            "God_2",
            Offering {
                id,
                message: "Offering to God 2".to_string(),
            },
        );
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    tracing::info!(events = args.events, "starting benchmark");
    let start = Instant::now();
    for id in 0..args.events {
        engine.push(
            "God_1",
            Offering {
                id,
                message: "Benchmark offering".to_string(),
            },
        );
    }
    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;
    let elapsed = start.elapsed();

    let stats = engine.stats();
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("Failed to serialize stats")?
        );
    } else {
        println!(
            "Pushed {} benchmark events in {:.3} seconds ({} dispatched, {} handler timeouts, {} skipped on a full pool, {} still queued).",
            args.events,
            elapsed.as_secs_f64(),
            stats.events_dispatched,
            stats.handler_timeouts,
            stats.pool_saturations,
            engine.pending()
        );
    }

    engine.shutdown().await;
    Ok(())
}
