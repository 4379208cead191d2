use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by refguard binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the service (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Level derived from the verbosity flags; `RUST_LOG` wins when set.
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        let config = match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")?
            }
            None => Configuration::load().context("Failed to load configuration")?,
        };
        Ok(config)
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        let config = config.redacted();
        if json {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("refguard configuration:");
            println!("=======================");
            println!("Database DSN: {}", config.database.dsn);
            println!("Peer assets URL: {}", config.peers.assets_url);
            println!("Peer timeout: {:?}", config.peers.timeout);
            println!("Peer connect timeout: {:?}", config.peers.connect_timeout);
            println!("Bulk ceiling: {}", config.guard.max_ids);
            println!("Chunk size: {}", config.guard.chunk_size);
            println!("Probe concurrency: {}", config.guard.probe_concurrency);
            println!("Sample limit: {}", config.guard.sample_limit);
            println!("Two-hop page size: {}", config.guard.two_hop_page_size);
            println!(
                "Hard delete: {}",
                if config.hard_delete_enabled() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate().context("Invalid configuration")?;
        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle common CLI commands that don't require starting services
    pub async fn handle_common_command(
        command: &CommonCommands,
        config: &Configuration,
    ) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_commands_default() {
        let default_cmd = CommonCommands::default();
        assert!(matches!(default_cmd, CommonCommands::Start));
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_log_level_flags() {
        let args = CommonArgs::parse_from(["refguard", "--verbose"]);
        assert_eq!(utils::log_level(&args), "debug");

        let args = CommonArgs::parse_from(["refguard", "-q"]);
        assert_eq!(utils::log_level(&args), "warn");

        let args = CommonArgs::parse_from(["refguard"]);
        assert_eq!(utils::log_level(&args), "info");
    }

    #[tokio::test]
    async fn test_validate_command_is_handled() {
        let config = crate::config::Configuration::default();
        let handled = utils::handle_common_command(&CommonCommands::Validate, &config)
            .await
            .unwrap();
        assert!(handled);

        let handled = utils::handle_common_command(&CommonCommands::Start, &config)
            .await
            .unwrap();
        assert!(!handled);
    }
}
