//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, status) and the
//! global flags (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Batch-evaluate alpha expressions on the WorldQuant BRAIN simulation API.
#[derive(Debug, Parser)]
#[command(name = "alpha-eval", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./alpha-eval.toml when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Evaluate every candidate in the given source files or directories.
    Run {
        /// JSON source files, or directories of them.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Maximum number of simulations in flight.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Directory that receives the `<source>_backtest.csv` ledgers.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Record simulation errors without asking the model for a fix.
        #[arg(long, default_value_t = false)]
        no_repair: bool,
    },

    /// Summarize the ledgers of the given sources, or ledger CSVs directly.
    Status {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}
