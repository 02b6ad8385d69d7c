//! sbv2-dispatch CLI - host diagnostics for backend selection

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use sbv2_dispatch::DispatchConfig;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt().with_env_filter("warn").init();
    }

    let config = DispatchConfig::load(cli.config.as_deref())?;
    tracing::debug!(
        path = ?cli.config,
        probe_timeout_ms = config.probe_timeout_ms,
        load_timeout_ms = config.load_timeout_ms,
        "configuration loaded"
    );

    match cli.command {
        Commands::Doctor { json, strict } => commands::doctor::run(&config, json, strict),
        Commands::Config { json } => commands::config_cmd::run(&config, cli.config.as_deref(), json),
    }
}
