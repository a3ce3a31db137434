//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// identity-mesh operator tool
#[derive(Parser, Debug)]
#[command(name = "identity-mesh")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "IDENTITY_MESH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "IDENTITY_MESH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "IDENTITY_MESH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check the configured identity agent and server endpoints
    Health {
        /// Keep monitoring on the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Mint a development CA and one SVID per service name
    DevCerts {
        /// Service names; each gets `<out>/<name>/` with its SVID and the
        /// shared bundle
        #[arg(short, long = "name", required = true)]
        names: Vec<String>,

        /// Trust domain
        #[arg(short, long, default_value = "example.org")]
        trust_domain: String,

        /// Output directory
        #[arg(short, long, default_value = "dev-certs")]
        out: PathBuf,

        /// SVID lifetime (e.g. `24h`)
        #[arg(
            long,
            default_value = "24h",
            value_parser = humantime_serde::re::humantime::parse_duration
        )]
        ttl: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_certs_accepts_repeated_names() {
        let cli = Cli::try_parse_from([
            "identity-mesh",
            "dev-certs",
            "--name",
            "payments",
            "--name",
            "billing-service",
            "--ttl",
            "2h",
        ])
        .unwrap();
        match cli.command {
            Command::DevCerts { names, ttl, trust_domain, .. } => {
                assert_eq!(names, vec!["payments", "billing-service"]);
                assert_eq!(ttl, Duration::from_secs(7200));
                assert_eq!(trust_domain, "example.org");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn health_watch_flag_parses() {
        let cli = Cli::try_parse_from(["identity-mesh", "health", "--watch"]).unwrap();
        assert!(matches!(cli.command, Command::Health { watch: true }));
    }
}
