//! rfidreader - Main Entry Point
//!
//! Loads the pipeline configuration, starts every configured reader and
//! runs until Ctrl-C, then shuts down gracefully and reports anything that
//! could not be delivered.

use anyhow::Context;
use clap::Parser;
use rfidreader::{
    config::{default_config_path, PipelineConfig},
    logging::init_logging,
    Coordinator,
};
use std::path::PathBuf;
use std::time::Duration;

/// RFID tag-event ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "rfidreader", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RFIDREADER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive (overrides RUST_LOG and the config file)
    #[arg(long)]
    log_filter: Option<String>,

    /// Seconds between status summaries in the log (0 disables)
    #[arg(long, default_value_t = 60)]
    status_interval: u64,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = match args.config {
        Some(path) => path,
        None => default_config_path().context("No --config given and no platform config directory")?,
    };
    let config = PipelineConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let _log_guard = init_logging(&config.logging, args.log_filter.as_deref())?;
    tracing::info!("Loaded configuration from {}", path.display());

    if args.check {
        tracing::info!("Configuration OK: {} readers", config.readers.len());
        return Ok(());
    }

    let mut coordinator = Coordinator::from_config(config)?;

    let events = coordinator.events();
    std::thread::Builder::new()
        .name("reader-events".into())
        .spawn(move || {
            for event in events {
                tracing::info!(
                    "[{}] {}{}",
                    event.reader_id,
                    event.status,
                    event.message.map(|m| format!(": {m}")).unwrap_or_default()
                );
            }
        })?;

    coordinator.start()?;

    let mut status_tick = match args.status_interval {
        0 => None,
        secs => {
            let mut tick = tokio::time::interval(Duration::from_secs(secs));
            tick.tick().await;
            Some(tick)
        }
    };
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = next_tick(&mut status_tick) => {
                let status = coordinator.status();
                for reader in &status.readers {
                    tracing::info!(
                        "[{}] {} / {}: {} frames, {} decode errors, {} active tags",
                        reader.reader_id,
                        reader.lane,
                        reader.connection.status,
                        reader.frames,
                        reader.decode_errors,
                        reader.dedup.active_entries
                    );
                }
                tracing::info!(
                    "Queue {}/{}: {} delivered, {} dropped, {} dead-lettered, {} discarded{}",
                    status.queue.depth,
                    status.queue.capacity,
                    status.queue.delivered,
                    status.queue.dropped,
                    status.queue.dead_lettered,
                    status.queue.discarded,
                    if status.queue_full() { " (FULL)" } else { "" }
                );
            }
        }
    }

    let report = coordinator.stop()?;
    if !report.undelivered.is_empty() {
        tracing::warn!(
            "{} events were not delivered before the shutdown timeout",
            report.undelivered.len()
        );
    }
    tracing::info!(
        "Shutdown complete: {} flushed, {} delivered, drained: {}",
        report.flushed,
        report.queue.delivered,
        report.drained
    );
    Ok(())
}

/// Next status tick, or never when status reporting is disabled
async fn next_tick(tick: &mut Option<tokio::time::Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}
