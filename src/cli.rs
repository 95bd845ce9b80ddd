//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Outstation Broker - certificate-authenticated per-connection outstations
#[derive(Parser, Debug)]
#[command(name = "outstation-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OUTSTATION_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Relay port to listen on
    #[arg(short, long, env = "OUTSTATION_BROKER_PORT")]
    pub port: Option<u16>,

    /// Relay host to bind to
    #[arg(long, env = "OUTSTATION_BROKER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OUTSTATION_BROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OUTSTATION_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker (default)
    Serve,

    /// Load and validate configuration and tenant data, then exit
    Check,

    /// Certificate generation commands
    #[command(subcommand)]
    Cert(CertCommand),
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum CertCommand {
    /// Create a self-signed tenant CA
    InitCa {
        /// CA common name
        #[arg(long, default_value = "Outstation Broker Tenant CA")]
        cn: String,

        /// CA organization
        #[arg(long)]
        org: Option<String>,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out_dir: PathBuf,

        /// File stem for `<stem>.crt` / `<stem>.key`
        #[arg(long, default_value = "ca")]
        name: String,
    },

    /// Issue a client certificate signed by a tenant CA
    IssueClient {
        /// Client common name
        #[arg(long, required = true)]
        cn: String,

        /// Client organization
        #[arg(long)]
        org: Option<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Signing CA certificate (PEM)
        #[arg(long, default_value = "certs/ca.crt")]
        ca_cert: PathBuf,

        /// Signing CA private key (PEM)
        #[arg(long, default_value = "certs/ca.key")]
        ca_key: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out_dir: PathBuf,

        /// File stem for `<stem>.crt` / `<stem>.key`
        #[arg(long, default_value = "client")]
        name: String,
    },

    /// Issue the relay's TLS server certificate signed by a CA
    IssueServer {
        /// Server common name
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// DNS subject alternative names
        #[arg(long = "san", default_value = "localhost")]
        san_dns: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Signing CA certificate (PEM)
        #[arg(long, default_value = "certs/ca.crt")]
        ca_cert: PathBuf,

        /// Signing CA private key (PEM)
        #[arg(long, default_value = "certs/ca.key")]
        ca_key: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out_dir: PathBuf,

        /// File stem for `<stem>.crt` / `<stem>.key`
        #[arg(long, default_value = "server")]
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["outstation-broker", "--port", "8443"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8443));
    }

    #[test]
    fn issue_client_requires_cn() {
        assert!(Cli::try_parse_from(["outstation-broker", "cert", "issue-client"]).is_err());
        let cli = Cli::try_parse_from([
            "outstation-broker",
            "cert",
            "issue-client",
            "--cn",
            "Test Client",
            "--org",
            "Test Org",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Cert(CertCommand::IssueClient { cn, org, .. })) => {
                assert_eq!(cn, "Test Client");
                assert_eq!(org.as_deref(), Some("Test Org"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["outstation-broker", "check", "--config", "broker.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.config, Some(PathBuf::from("broker.yaml")));
    }
}
