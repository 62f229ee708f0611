//! # vault-sync CLI (`vsync`)
//!
//! The `vsync` binary drives the block sync engine and the concept dedup
//! engine against a local SQLite database.
//!
//! ## Usage
//!
//! ```bash
//! vsync --config ./config/vsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsync init` | Create the SQLite database and run schema migrations |
//! | `vsync sync` | Sweep every vault tier into the graph |
//! | `vsync publish <file>` | Enqueue dirty-block messages for one file |
//! | `vsync consume` | Apply queued dirty-block messages |
//! | `vsync dedup` | Merge or promote pending concept candidates |
//! | `vsync inspect <file>` | Show the blocks found in a file |
//! | `vsync stats` | Database and queue overview |
//!
//! Logs go to stderr; set `RUST_LOG` (e.g. `RUST_LOG=vault_sync=debug`) to
//! change verbosity.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vault_sync::{commands, config, migrate, stats};

/// vault-sync CLI: keep a block graph in step with a Markdown vault.
///
/// All commands except `inspect` accept a `--config` flag pointing to a
/// TOML configuration file.
#[derive(Parser)]
#[command(
    name = "vsync",
    about = "Sync versioned vault blocks into a graph and deduplicate concepts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Reconcile every block in the vault against the graph.
    ///
    /// The vault is authoritative: changed blocks are written with the
    /// vault's version even when the graph holds a higher one.
    Sync {
        /// Only sweep this tier.
        #[arg(long)]
        tier: Option<String>,

        /// Parse and count without writing to the graph.
        #[arg(long)]
        dry_run: bool,

        /// Print statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Consume dirty-block messages from the queue.
    ///
    /// Runs until Ctrl-C. Stale messages (lower version than the graph)
    /// are acknowledged without writing.
    Consume {
        /// Stop after this many messages.
        #[arg(long)]
        max_messages: Option<u64>,
    },

    /// Diff a file and enqueue one message per changed block.
    Publish {
        /// File to publish, absolute or relative to the vault root.
        file: PathBuf,

        /// Earlier copy of the file to diff against. Without it every block
        /// is reported as added.
        #[arg(long)]
        previous: Option<PathBuf>,
    },

    /// Merge or promote every pending concept candidate.
    Dedup {
        /// Print the batch result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the versioned blocks extracted from a file.
    Inspect {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Show database statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Inspect { file, json } = &cli.command {
        return commands::run_inspect(file, *json).await;
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { tier, dry_run, json } => {
            commands::run_sync(&cfg, tier, dry_run, json).await?;
        }
        Commands::Consume { max_messages } => {
            commands::run_consume(&cfg, max_messages).await?;
        }
        Commands::Publish { file, previous } => {
            commands::run_publish(&cfg, &file, previous).await?;
        }
        Commands::Dedup { json } => {
            commands::run_dedup(&cfg, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Inspect { .. } => {}
    }

    Ok(())
}
