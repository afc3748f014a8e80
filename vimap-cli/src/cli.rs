//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream input lines through a pool of worker processes
    Run {
        /// Name of the built-in transform each worker runs
        #[arg(long, value_name = "NAME")]
        transform: String,

        /// Number of workers (defaults to pool.worker_count)
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Read input lines from a file instead of stdin
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,

        /// Parse every input line as JSON instead of passing it as a string
        #[arg(long)]
        json: bool,

        /// Positional initialization arguments as a JSON array
        #[arg(long, value_name = "JSON", default_value = "[]")]
        init_args: String,

        /// Keyword initialization arguments as a JSON object
        #[arg(long, value_name = "JSON", default_value = "{}")]
        init_kwargs: String,

        /// Enqueue the whole input up front instead of streaming it
        #[arg(long)]
        eager: bool,
    },

    /// List the built-in transforms
    Transforms,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },

    /// Run as a pool worker over stdin/stdout (internal use)
    #[command(hide = true)]
    Worker {
        /// Worker index within the pool
        #[arg(long, value_name = "ID")]
        worker_id: usize,

        /// Transform to build
        #[arg(long, value_name = "NAME")]
        transform: String,

        /// Positional initialization arguments as a JSON array
        #[arg(long, value_name = "JSON", default_value = "[]")]
        init_args: String,

        /// Keyword initialization arguments as a JSON object
        #[arg(long, value_name = "JSON", default_value = "{}")]
        init_kwargs: String,

        /// How long a receive waits before checking again
        #[arg(long, value_name = "MS", default_value_t = 20)]
        poll_interval_ms: u64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration in use
    Show {
        /// Path to configuration file (optional, uses default loading logic)
        #[arg(long, value_name = "PATH")]
        config_file: Option<PathBuf>,

        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
