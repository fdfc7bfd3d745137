//! Collector CLI
//!
//! Runs the firehose consumer or a backfill crawl against a local SQLite
//! database.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use collector::{
    error::{AppError, Result},
    models::{Config, EntityKind, PipelineStats},
    pipeline::{BatchFlusher, Crawler, StreamConsumer},
    services::{JetstreamSource, XrpcClient},
    storage::{CheckpointStore, EntityStore, FileCheckpointStore, SqliteStore},
    utils::log,
};
use tokio::sync::watch;

/// Collector - firehose ingestion and graph backfill
#[derive(Parser, Debug)]
#[command(
    name = "collector",
    version,
    about = "Social firehose ingestion and resumable graph backfill"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the live firehose until Ctrl-C
    Stream,

    /// Crawl the follow graph outward from seed accounts
    Backfill {
        /// Seed account DID (repeatable)
        #[arg(long = "seed")]
        seeds: Vec<String>,

        /// File with one seed DID per line
        #[arg(long)]
        seeds_file: Option<PathBuf>,

        /// Stop after this many items
        #[arg(long)]
        max_items: Option<u64>,
    },

    /// Validate the configuration file
    Validate,

    /// Show checkpoint and table counts
    Info,
}

/// Initialize logging based on the verbosity flag and configured level.
fn init_logging(verbose: bool, configured: &str) {
    let level = if verbose {
        ::log::LevelFilter::Debug
    } else {
        log::parse_level(configured)
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .format_timestamp_secs()
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::load_or_default(path)?;
    config.apply_env_overrides()?;
    Ok(config)
}

/// Ctrl-C flips the returned receiver to `true`.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ::log::info!("Ctrl-C received; shutting down gracefully");
            let _ = tx.send(true);
        }
        // Keep the sender alive so receivers never observe a closed channel
        std::future::pending::<()>().await;
    });
    rx
}

/// Inline seeds followed by those in `file`, first occurrence kept.
fn read_seeds(inline: Vec<String>, file: Option<&Path>) -> Result<Vec<String>> {
    let mut seeds = inline;
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)?;
        seeds.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    let mut seen = HashSet::new();
    seeds.retain(|seed| seen.insert(seed.clone()));
    Ok(seeds)
}

fn open_flusher(config: &Config) -> Result<Arc<BatchFlusher>> {
    let store = Arc::new(SqliteStore::open(&config.storage.database_path)?);
    Ok(Arc::new(BatchFlusher::new(
        store,
        config,
        Arc::new(PipelineStats::new()),
    )))
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose, "info");
            ::log::error!("Failed to load {}: {e}", cli.config.display());
            return Err(e);
        }
    };
    init_logging(cli.verbose, &config.logging.level);

    ::log::info!("Collector starting...");
    if let Err(e) = config.validate() {
        ::log::error!("Config validation failed: {e}");
        return Err(e);
    }

    match cli.command {
        Command::Stream => {
            log::header("Firehose");
            let flusher = open_flusher(&config)?;
            let source = Arc::new(JetstreamSource::new(&config.stream)?);
            let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint.path));
            let consumer = StreamConsumer::new(source, Arc::clone(&flusher), checkpoints, &config);

            let report = consumer.run(shutdown_signal()).await?;
            log::summary(
                "Stream",
                &[
                    ("Messages", report.messages.to_string()),
                    ("Last cursor", format!("{:?}", report.last_cursor)),
                    ("Reconnects", report.reconnects.to_string()),
                    ("Storage circuit", format!("{:?}", flusher.breaker().state())),
                    ("Elapsed", format!("{:.1?}", report.elapsed)),
                ],
            );
            log::counters("Counters", &flusher.stats().to_map());
        }

        Command::Backfill {
            seeds,
            seeds_file,
            max_items,
        } => {
            log::header("Backfill");
            if max_items.is_some() {
                config.crawler.max_items = max_items;
            }
            let seeds = read_seeds(seeds, seeds_file.as_deref())?;
            let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint.crawl_path));
            if seeds.is_empty() && checkpoints.load().await?.is_none() {
                return Err(AppError::config(
                    "No seeds given and no crawl checkpoint to resume from",
                ));
            }

            let flusher = open_flusher(&config)?;
            let api = Arc::new(XrpcClient::new(&config.crawler)?);
            let crawler = Crawler::new(api, Arc::clone(&flusher), checkpoints, &config);

            let report = crawler.run(&seeds, shutdown_signal()).await?;
            log::summary(
                "Backfill",
                &[
                    ("Stopped", format!("{:?}", report.stop_reason)),
                    ("Completed", report.completed.to_string()),
                    ("Failed", report.failed.to_string()),
                    ("Admitted", report.admitted.to_string()),
                    ("Rejected", report.rejected.to_string()),
                    ("Pending", report.pending.to_string()),
                    ("API circuit", format!("{:?}", crawler.breaker().state())),
                    ("Storage circuit", format!("{:?}", flusher.breaker().state())),
                    ("Elapsed", format!("{:.1?}", report.elapsed)),
                ],
            );
            log::counters("Counters", &flusher.stats().to_map());
        }

        Command::Validate => {
            ::log::info!("✓ Config OK ({})", cli.config.display());
            ::log::info!("All validations passed!");
        }

        Command::Info => {
            log::header("Info");
            ::log::info!("Database: {}", config.storage.database_path);
            for (label, path) in [
                ("Stream", &config.checkpoint.path),
                ("Backfill", &config.checkpoint.crawl_path),
            ] {
                match FileCheckpointStore::new(path).load().await? {
                    Some(checkpoint) => {
                        let mut items = vec![
                            ("Updated", checkpoint.updated_at.to_rfc3339()),
                            ("Cursor", format!("{:?}", checkpoint.cursor)),
                        ];
                        if let Some(frontier) = &checkpoint.frontier {
                            items.push(("Frontier pending", frontier.pending.len().to_string()));
                            items.push(("Frontier visited", frontier.visited.len().to_string()));
                        }
                        log::summary(&format!("{label} checkpoint"), &items);
                        log::counters(&format!("{label} counters"), &checkpoint.counters);
                    }
                    None => ::log::info!("{label} checkpoint: none"),
                }
            }

            if Path::new(&config.storage.database_path).exists() {
                let store = SqliteStore::open(&config.storage.database_path)?;
                let mut items = Vec::new();
                for kind in EntityKind::FLUSH_ORDER {
                    items.push((kind.as_str(), store.count(kind).await?.to_string()));
                }
                log::summary("Tables", &items);
            } else {
                ::log::info!("Database not created yet.");
            }
        }
    }

    ::log::info!("Done!");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_seeds_drops_repeats_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(
            &path,
            "did:plc:b\n# comment\n\n  did:plc:a  \ndid:plc:c\ndid:plc:b\n",
        )
        .unwrap();

        let seeds = read_seeds(
            vec!["did:plc:a".to_string(), "did:plc:c".to_string()],
            Some(&path),
        )
        .unwrap();
        assert_eq!(seeds, vec!["did:plc:a", "did:plc:c", "did:plc:b"]);
    }
}
