//! Exposes the command line application.
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filestash_service::config::Config;
use filestash_service::metrics;

use crate::commands;
use crate::logging;

/// Filestash commands.
#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Remove all entries that are expired as of now.
    Cleanup {
        /// Only print the keys that would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// List all cached keys with their data file and expiration time.
    List,

    /// Remove the given keys and their data files.
    Evict {
        /// The keys to remove.
        #[arg(required = true, value_name = "KEY")]
        keys: Vec<String>,
    },

    /// Print the path of the data file that stores a key.
    ///
    /// This does not check whether the key is actually cached.
    Path {
        /// The cache key.
        key: String,
    },
}

/// Inspect and maintain a filestash cache directory.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to set up metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(commands::run(&config, cli.command, &mut io::stdout().lock()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cleanup() {
        let cli = Cli::try_parse_from(["filestash", "cleanup"]).unwrap();
        assert_eq!(cli.command, Command::Cleanup { dry_run: false });
        assert_eq!(cli.config(), None);

        let cli = Cli::try_parse_from(["filestash", "cleanup", "--dry-run", "-c", "cfg.yml"]).unwrap();
        assert_eq!(cli.command, Command::Cleanup { dry_run: true });
        assert_eq!(cli.config(), Some(Path::new("cfg.yml")));
    }

    #[test]
    fn test_parse_evict() {
        let cli = Cli::try_parse_from(["filestash", "--config", "cfg.yml", "evict", "a", "b"])
            .unwrap();
        assert_eq!(
            cli.command,
            Command::Evict {
                keys: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(cli.config(), Some(Path::new("cfg.yml")));
    }

    #[test]
    fn test_parse_evict_requires_keys() {
        assert!(Cli::try_parse_from(["filestash", "evict"]).is_err());
    }

    #[test]
    fn test_parse_path() {
        let cli = Cli::try_parse_from(["filestash", "path", "some key"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Path {
                key: "some key".into()
            }
        );
    }

    #[test]
    fn test_parse_requires_command() {
        assert!(Cli::try_parse_from(["filestash"]).is_err());
        assert!(Cli::try_parse_from(["filestash", "run"]).is_err());
    }
}
