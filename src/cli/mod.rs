//! Command-line entry points.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::app::Config;

#[derive(Debug, Parser)]
#[command(name = "feedgate", version, about = "Real-time price oracle gateway")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway (the default when no subcommand is given).
    Run,
    /// Validate the configuration file and print a summary.
    Check,
    /// Print the resolved feed catalog.
    Feeds,
}

/// `feedgate check`: load, validate, summarize.
pub fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let catalog = config.catalog()?;
    println!("configuration OK: {}", config_path.display());
    println!("  listen        {}", config.server.listen);
    println!("  feeds         {}", catalog.len());
    println!("  min sources   {}", config.oracle.min_sources);
    println!("  max age       {} ms", config.oracle.max_age_ms);
    Ok(())
}

/// `feedgate feeds`: one line per catalog entry.
pub fn feeds(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    for entry in config.catalog()? {
        let sources: Vec<String> = entry
            .sources
            .iter()
            .map(|s| {
                if s.backup {
                    format!("{}:{} (backup)", s.exchange, s.symbol)
                } else {
                    format!("{}:{}", s.exchange, s.symbol)
                }
            })
            .collect();
        println!("{} [{}] {}", entry.feed, entry.decimals, sources.join(", "));
    }
    Ok(())
}
