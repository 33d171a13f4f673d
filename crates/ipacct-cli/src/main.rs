#![deny(unsafe_code)]

//! ipacct CLI: runs the accounting daemon and inspects its configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipacct_config::AppConfig;
use ipacct_core::{Daemon, PluginRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("IPACCT_GIT_HASH"),
    ", ",
    env!("IPACCT_BUILD_PROFILE"),
    ")"
);

/// ipacctd: per-address IP traffic accounting.
#[derive(Parser)]
#[command(name = "ipacctd", version = VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "ipacct.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until SIGTERM or SIGINT.
    Run,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// List the built-in storage plugins.
    Plugins,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(&cli.config, cli.verbose).await?,
        Commands::Config { show } => cmd_config(&cli.config, show).await?,
        Commands::Plugins => cmd_plugins(),
    }

    Ok(())
}

/// `-v` wins over `RUST_LOG`, which wins over `logging.level`.
fn init_tracing(verbose: u8, configured: &str) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured)),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_run(config_path: &Path, verbose: u8) -> Result<()> {
    let config = load_config(config_path).await?;
    init_tracing(verbose, &config.logging.level);
    info!(version = VERSION, config = %config_path.display(), "starting ipacctd");

    // The daemon blocks in its own event loop and writer thread.
    let stats = tokio::task::spawn_blocking(move || Daemon::new(config).run())
        .await
        .context("daemon thread panicked")??;

    info!(rounds = stats.rounds, records = stats.records, "ipacctd exiting");
    Ok(())
}

async fn cmd_config(config_path: &Path, show: bool) -> Result<()> {
    let config = load_config(config_path).await?;
    if show {
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!(
            "Configuration at '{}' is valid ({} groups).",
            config_path.display(),
            config.groups.len()
        );
    }
    Ok(())
}

fn cmd_plugins() {
    let registry = PluginRegistry::builtin();
    for plugin in registry.plugins() {
        println!("{:<10} {}", plugin.name, plugin.description);
    }
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration in '{}'", path.display()))
    } else {
        eprintln!(
            "Config file '{}' not found, using defaults",
            path.display()
        );
        Ok(AppConfig::default())
    }
}
