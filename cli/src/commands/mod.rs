//! CLI command definitions and dispatch.

mod images;
mod inspect;
mod scan;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use layerscan_core::config::ScanConfig;

/// layerscan - package inventory and vulnerability scans for container images.
#[derive(Parser)]
#[command(name = "layerscan", version, about)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Scan the packages of a local or pulled image
    Scan(scan::ScanArgs),
    /// Show the inventory of a saved image archive
    Inspect(inspect::InspectArgs),
    /// List images known to the container runtime
    Images(images::ImagesArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ScanConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Scan(args) => scan::execute(args, config).await,
        Command::Inspect(args) => inspect::execute(args).await,
        Command::Images(args) => images::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_scan() {
        let cli = Cli::try_parse_from([
            "layerscan",
            "--verbose",
            "scan",
            "debian:11",
            "--broker-host",
            "mqtt.local",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Scan(args) => {
                assert_eq!(args.image, "debian:11");
                assert_eq!(args.broker_host.as_deref(), Some("mqtt.local"));
                assert!(args.dry_run);
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from(["layerscan", "inspect", "image.tar", "--packages", "--json"]).unwrap();
        match cli.command {
            Command::Inspect(args) => {
                assert_eq!(args.archive, PathBuf::from("image.tar"));
                assert!(args.packages);
                assert!(args.json);
            }
            _ => panic!("expected inspect"),
        }
    }
}
