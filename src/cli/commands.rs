//! CLI commands and argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Klaviyo source connector CLI
#[derive(Parser, Debug)]
#[command(name = "klaviyo-source")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Emit the JSON specification of recognized config fields
    Spec,

    /// Validate the configuration against the live API
    Check {
        /// Configuration file (JSON)
        #[arg(long)]
        config: PathBuf,
    },

    /// Emit the catalog of available streams
    Discover {
        /// Configuration file (JSON)
        #[arg(long)]
        config: PathBuf,
    },

    /// Read records and emit newline-delimited protocol messages
    Read {
        /// Configuration file (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Configured catalog file (JSON)
        #[arg(long)]
        catalog: PathBuf,

        /// Saved state file (JSON)
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_command() {
        let cli = Cli::parse_from([
            "klaviyo-source",
            "read",
            "--config",
            "config.json",
            "--catalog",
            "catalog.json",
            "--state",
            "state.json",
        ]);
        match cli.command {
            Commands::Read {
                config,
                catalog,
                state,
            } => {
                assert_eq!(config, PathBuf::from("config.json"));
                assert_eq!(catalog, PathBuf::from("catalog.json"));
                assert_eq!(state, Some(PathBuf::from("state.json")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_state_is_optional() {
        let cli = Cli::parse_from([
            "klaviyo-source",
            "read",
            "--config",
            "c.json",
            "--catalog",
            "cat.json",
        ]);
        match cli.command {
            Commands::Read { state, .. } => assert!(state.is_none()),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
