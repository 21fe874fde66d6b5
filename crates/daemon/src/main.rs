//! Tessera - background resource cache
//!
//! Composition root: wires the SQLite store, the worker pool and the
//! filesystem generator into a `ResourceCache` and runs one command.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tessera_core::CacheConfig;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const MAX_CLI_SCALE: i64 = 16;

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Tessera resource cache", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database path or sqlite: URL (overrides TESSERA_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Worker threads (overrides TESSERA_WORKER_THREADS)
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Hash, inspect and tile files, filling the cache
    Warm {
        /// Files to process
        #[arg(required = true)]
        paths: Vec<String>,

        /// Tile every scale from 0 up to this one (image downscaled by 2^scale)
        #[arg(short, long, default_value = "0", value_parser = clap::value_parser!(i32).range(0..=MAX_CLI_SCALE))]
        scale: i32,
    },

    /// List cached files
    List {
        /// Glob pattern on the path (`*`, `?`, `[...]`)
        #[arg(short, long)]
        pattern: Option<String>,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Drop a file and its tiles from the cache
    Forget {
        path: String,
    },

    /// Reclaim unused database space
    Vacuum,

    /// Summarize a thumbnail cache file written by older releases
    Legacy {
        file: String,

        /// Print every record
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    info!("Tessera v{} starting...", VERSION);

    if let Commands::Legacy { file, verbose } = &cli.command {
        return commands::legacy(file, *verbose);
    }

    // 1. Load configuration (flags win over environment)
    let mut config = CacheConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(workers) = cli.workers {
        config.worker_threads = workers;
    }

    // 2. Start storage actor and worker pool
    let pipeline = commands::Pipeline::open(config)?;

    // 3. Run the command
    let result = match cli.command {
        Commands::Warm { paths, scale } => commands::warm(&pipeline, &paths, scale),
        Commands::List { pattern, json } => commands::list(&pipeline, pattern, json),
        Commands::Forget { path } => commands::forget(&pipeline, &path),
        Commands::Vacuum => commands::vacuum(&pipeline),
        Commands::Legacy { .. } => Ok(()),
    };

    // 4. Graceful shutdown: drain workers, then the storage queue
    pipeline.shutdown();
    info!("Shutdown complete.");

    result
}

/// Logging to stderr; `TESSERA_LOG_FORMAT=json` for structured output
fn init_logging() -> Result<()> {
    let log_format = std::env::var("TESSERA_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("tessera=info"))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    match log_format.as_str() {
        "json" => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_warm_arguments() {
        let cli = Cli::try_parse_from(["tessera", "--db", "sqlite::memory:", "warm", "-s", "2", "a.png", "b.png"]).unwrap();
        assert_eq!(cli.db.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Commands::Warm { paths, scale } => {
                assert_eq!(paths, vec!["a.png", "b.png"]);
                assert_eq!(scale, 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_scale_out_of_range_rejected() {
        assert!(Cli::try_parse_from(["tessera", "warm", "-s", "17", "a.png"]).is_err());
        assert!(Cli::try_parse_from(["tessera", "warm", "-s", "-1", "a.png"]).is_err());
        assert!(Cli::try_parse_from(["tessera", "warm"]).is_err());
    }
}
