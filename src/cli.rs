// src/cli.rs

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "keypool-proxy",
    version,
    about = "Load-balancing reverse proxy for a pool of LLM API keys",
    long_about = "Multiplexes LLM API traffic across a pool of keys, selecting one per request by a configurable strategy, enforcing per-key RPM/TPM limits and failing over when a key is rejected."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "KEYPOOL_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Server port (overrides the file and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable JSON logging
    #[arg(long, env = "KEYPOOL_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Start the proxy server (default)
    Serve,
    /// Load and validate the configuration, print the effective settings and exit
    CheckConfig,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Serve)
    }

    /// `--config`, else `CONFIG_PATH` when the flag was left at its default.
    pub fn config_path(&self) -> PathBuf {
        if self.config == PathBuf::from("config.yaml") {
            if let Ok(path) = std::env::var("CONFIG_PATH") {
                return PathBuf::from(path);
            }
        }
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["keypool-proxy", "--port", "9000"]).unwrap();
        assert_eq!(cli.command(), Commands::Serve);
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn parses_check_config() {
        let cli = Cli::try_parse_from(["keypool-proxy", "-c", "/etc/keypool.yaml", "check-config"]).unwrap();
        assert_eq!(cli.command(), Commands::CheckConfig);
        assert_eq!(cli.config, PathBuf::from("/etc/keypool.yaml"));
    }
}
