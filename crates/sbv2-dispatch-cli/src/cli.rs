//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// sbv2-dispatch - inspect backend selection on this host
#[derive(Parser)]
#[command(name = "sbv2-dispatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Report host capabilities and which backends can run here
    Doctor {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,

        /// Exit with an error when no backend can run
        #[arg(long)]
        strict: bool,
    },

    /// Print the resolved dispatch configuration
    Config {
        /// Emit the configuration as JSON
        #[arg(long)]
        json: bool,
    },
}
