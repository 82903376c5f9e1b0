//! CLI parser and command dispatch.

mod enrich;
mod import;
mod init;
mod maintenance;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use listing_import::config::{load_settings_with_options, LoadOptions};

pub use import::ImportArgs;

#[derive(Parser)]
#[command(name = "listing-import")]
#[command(about = "Resumable batch importer for laundromat listings")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory or database file (overrides config file and environment).
    /// Can be a directory containing listings.db or a .db file directly.
    #[arg(long, short = 'd', global = true)]
    data: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and database schema
    Init,

    /// Import listings from a CSV, TSV or JSON Lines file
    Import(ImportArgs),

    /// Show checkpoint progress and live table counts
    Status {
        /// Run key whose checkpoint to show
        #[arg(long)]
        run_key: Option<String>,
        /// Checkpoint backend: file or database
        #[arg(long)]
        checkpoint: Option<listing_import::import::CheckpointBackend>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Recompute every state and city listing count from the listings table
    Recount,

    /// Delete the checkpoint for a run key so the next import starts over
    Reset {
        /// Run key whose checkpoint to delete
        #[arg(long)]
        run_key: Option<String>,
        /// Checkpoint backend: file or database
        #[arg(long)]
        checkpoint: Option<listing_import::import::CheckpointBackend>,
    },

    /// Refine stored listings with external data
    Enrich {
        #[command(subcommand)]
        command: EnrichCommands,
    },
}

#[derive(Subcommand)]
enum EnrichCommands {
    /// Geocode listings whose coordinates are a state centroid
    Geocode {
        /// Maximum number of listings to geocode (overrides config)
        #[arg(short, long)]
        limit: Option<usize>,
        /// Concurrent requests (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Skip the on-disk response cache
        #[arg(long)]
        no_cache: bool,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data: cli.data,
    };
    let (settings, config) = load_settings_with_options(options).await?;

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Import(args) => import::cmd_import(&settings, &config, args).await,
        Commands::Status {
            run_key,
            checkpoint,
            json,
        } => {
            let backend = checkpoint.unwrap_or(config.import.checkpoint);
            status::cmd_status(&settings, backend, run_key.as_deref(), json).await
        }
        Commands::Recount => maintenance::cmd_recount(&settings).await,
        Commands::Reset {
            run_key,
            checkpoint,
        } => {
            let backend = checkpoint.unwrap_or(config.import.checkpoint);
            maintenance::cmd_reset(&settings, backend, run_key.as_deref()).await
        }
        Commands::Enrich { command } => match command {
            EnrichCommands::Geocode {
                limit,
                concurrency,
                no_cache,
            } => {
                let mut enrich = config.enrich.clone();
                if let Some(limit) = limit {
                    enrich.limit = limit;
                }
                if let Some(concurrency) = concurrency {
                    enrich.concurrency = concurrency;
                }
                if no_cache {
                    enrich.cache = false;
                }
                enrich::cmd_geocode(&settings, &enrich).await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_import_flags() {
        let cli = Cli::try_parse_from([
            "listing-import",
            "--data",
            "/tmp/listings",
            "import",
            "listings.csv",
            "--batch-size",
            "50",
            "--partition",
            "state",
            "--state",
            "CO",
            "--state",
            "WY",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.data, Some(PathBuf::from("/tmp/listings")));
        match cli.command {
            Commands::Import(args) => {
                assert_eq!(args.source, PathBuf::from("listings.csv"));
                assert_eq!(args.batch_size, Some(50));
                assert_eq!(args.states, vec!["CO", "WY"]);
                assert!(args.dry_run);
            }
            _ => panic!("expected import"),
        }
    }

    #[test]
    fn test_rejects_unknown_partition_mode() {
        let result = Cli::try_parse_from([
            "listing-import",
            "import",
            "listings.csv",
            "--partition",
            "zip",
        ]);
        assert!(result.is_err());
    }
}
