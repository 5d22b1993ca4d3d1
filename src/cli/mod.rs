//! CLI interface and argument parsing
//!
//! This module provides the command-line interface of the exporter using clap.

pub mod commands;

use clap::{Parser, Subcommand};

/// Medication Exporter - ePA medication event export over TEE3
#[derive(Parser, Debug)]
#[command(name = "medication-exporter")]
#[command(version, about, long_about = None)]
#[command(author = "Medication Exporter Contributors")]
pub struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "medication-exporter.toml",
        env = "MEDEXPORT_CONFIG"
    )]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "MEDEXPORT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export pending medication events until stopped
    Run(commands::run::RunArgs),

    /// Establish a TEE3 channel to every configured ePA host
    CheckConnection(commands::check_connection::CheckConnectionArgs),

    /// Validate configuration file
    ValidateConfig(commands::validate::ValidateArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["medication-exporter", "run"]);
        assert_eq!(cli.config, "medication-exporter.toml");
        assert!(matches!(cli.command, Commands::Run(_)));
    }

    #[test]
    fn test_cli_parse_run_overrides() {
        let cli = Cli::parse_from([
            "medication-exporter",
            "run",
            "--memory-store",
            "--workers",
            "2",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.memory_store);
                assert_eq!(args.workers, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::parse_from(["medication-exporter", "--config", "custom.toml", "run"]);
        assert_eq!(cli.config, "custom.toml");
    }

    #[test]
    fn test_cli_parse_with_log_level() {
        let cli = Cli::parse_from(["medication-exporter", "--log-level", "debug", "run"]);
        assert_eq!(cli.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_cli_parse_check_connection() {
        let cli = Cli::parse_from(["medication-exporter", "check-connection", "--self-test"]);
        match cli.command {
            Commands::CheckConnection(args) => {
                assert!(args.self_test);
                assert_eq!(args.timeout_secs, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_validate_config() {
        let cli = Cli::parse_from(["medication-exporter", "validate-config", "--check-keys"]);
        assert!(matches!(cli.command, Commands::ValidateConfig(args) if args.check_keys));
    }
}
