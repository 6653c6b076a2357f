use std::path::PathBuf;

use clap::{Parser, Subcommand};
use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use tracing::Level;

use crate::conf::TunnelOpts;
use crate::error::{GuiseError, Result};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to an optional YAML configuration file.
    #[arg(short, long, value_name = "FILE", env = "GUISE_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "GUISE_LOG_LEVEL",
        default_value = "info",
        value_parser = parse_level
    )]
    pub log_level: Level,

    /// Skip the HTTP decoy exchange after the TCP handshake.
    #[arg(long, action = clap::ArgAction::SetTrue, env = "GUISE_NO_HTTP")]
    pub no_http: bool,

    /// Silently drop captured RST segments.
    #[arg(long, action = clap::ArgAction::SetTrue, env = "GUISE_IGNORE_RST")]
    pub ignore_rst: bool,

    /// TOS byte stamped on every emitted IPv4 packet.
    #[arg(long, value_name = "BYTE", env = "GUISE_DSCP", default_value_t = 0)]
    pub dscp: u8,

    /// Host name placed in the decoy request headers.
    #[arg(long, value_name = "NAME", env = "GUISE_HOST")]
    pub host: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Dial a remote endpoint and relay a local UDP socket through it
    Client {
        /// UDP address to accept application datagrams on
        #[arg(
            short,
            long,
            value_name = "ADDR",
            env = "GUISE_CLIENT_LISTEN",
            default_value = "127.0.0.1:29900"
        )]
        listen: String,
        /// Remote tunnel endpoint ("ip:port")
        #[arg(short, long, value_name = "ADDR", env = "GUISE_REMOTE")]
        remote: String,
    },
    /// Accept tunnel flows and forward their datagrams to a UDP service
    Server {
        /// Local address to accept tunnel flows on ("ip:port")
        #[arg(short, long, value_name = "ADDR", env = "GUISE_SERVER_LISTEN")]
        listen: String,
        /// UDP service datagrams are forwarded to
        #[arg(short, long, value_name = "ADDR", env = "GUISE_FORWARD")]
        forward: String,
    },
}

impl Cli {
    /// Resolves the effective tunnel options: YAML file first (when
    /// given), then any flag set on the command line on top.
    pub fn tunnel_opts(&self) -> Result<TunnelOpts> {
        let mut figment = Figment::from(Serialized::defaults(TunnelOpts::default()));
        if let Some(path) = &self.config {
            figment = figment.merge(Yaml::file(path));
        }
        let mut opts: TunnelOpts = figment
            .extract()
            .map_err(|e| GuiseError::Conf(e.to_string()))?;

        if self.no_http {
            opts.no_http = true;
        }
        if self.ignore_rst {
            opts.ignore_rst = true;
        }
        if self.dscp != 0 {
            opts.dscp = self.dscp;
        }
        if let Some(host) = &self.host {
            opts.host = Some(host.clone());
        }
        Ok(opts)
    }
}

fn parse_level(raw: &str) -> std::result::Result<Level, String> {
    raw.parse::<Level>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from([
                "guise",
                "--log-level",
                "warn",
                "--no-http",
                "--dscp",
                "46",
                "--host",
                "cdn.example.com",
                "client",
                "--remote",
                "203.0.113.5:4500",
            ]);
            assert_eq!(cli.log_level, Level::WARN);
            let opts = cli.tunnel_opts().unwrap();
            assert!(opts.no_http);
            assert!(!opts.ignore_rst);
            assert_eq!(opts.dscp, 46);
            assert_eq!(opts.host.as_deref(), Some("cdn.example.com"));
            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_flags() {
        Jail::expect_with(|jail| {
            jail.set_env("GUISE_LOG_LEVEL", "debug");
            jail.set_env("GUISE_IGNORE_RST", "true");
            jail.set_env("GUISE_REMOTE", "203.0.113.5:4500");

            let cli = Cli::parse_from(["guise", "client"]);
            assert_eq!(cli.log_level, Level::DEBUG);
            let opts = cli.tunnel_opts().unwrap();
            assert!(opts.ignore_rst);
            assert!(!opts.no_http);
            Ok(())
        });
    }

    #[test]
    fn config_file_fills_unset_flags() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "guise.yaml",
                "no_http: true\nhost: updates.example.net\ndscp: 10\n",
            )?;
            let cli = Cli::parse_from([
                "guise",
                "--config",
                "guise.yaml",
                "--host",
                "override.example.net",
                "server",
                "--listen",
                "10.0.0.1:4500",
                "--forward",
                "127.0.0.1:51820",
            ]);
            let opts = cli.tunnel_opts().unwrap();
            assert!(opts.no_http);
            assert_eq!(opts.dscp, 10);
            // Command line wins over the file.
            assert_eq!(opts.host.as_deref(), Some("override.example.net"));
            Ok(())
        });
    }

    #[test]
    fn default_log_level_is_info() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["guise", "client", "--remote", "203.0.113.5:4500"]);
            assert_eq!(cli.log_level, Level::INFO);
            Ok(())
        });
    }
}
