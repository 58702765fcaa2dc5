use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// How long a client without query parameters has to send `roomJoin`.
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Export tracing spans to stdout through OpenTelemetry.
    pub otel_stdout: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            otel_stdout: false,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "parley-relay",
    author,
    version,
    about = "Signaling relay that pairs two Parley peers per room"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "PARLEY_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Maximum time clients without query parameters have to send roomJoin.
    #[arg(long, env = "PARLEY_RELAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    pub handshake_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PARLEY_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Print OpenTelemetry spans to stdout.
    #[arg(
        long,
        env = "PARLEY_RELAY_OTEL_STDOUT",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub otel_stdout: bool,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        anyhow::ensure!(
            cli.handshake_timeout_secs > 0,
            "handshake timeout must be greater than zero"
        );
        Ok(RelayConfig {
            listen_addr,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            otel_stdout: cli.otel_stdout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_flags_into_config() {
        let cli = Cli::parse_from([
            "parley-relay",
            "--listen-addr",
            "127.0.0.1:9000",
            "--handshake-timeout-secs",
            "3",
        ]);
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert!(!config.otel_stdout);

        let cli = Cli::parse_from(["parley-relay", "--otel-stdout"]);
        assert!(RelayConfig::try_from(cli).unwrap().otel_stdout);
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_address() {
        let cli = Cli::parse_from(["parley-relay", "--listen-addr", "not-an-addr"]);
        assert!(RelayConfig::try_from(cli).is_err());
    }

    #[test_timeout::timeout]
    fn rejects_zero_handshake_timeout() {
        let cli = Cli::parse_from(["parley-relay", "--handshake-timeout-secs", "0"]);
        assert!(RelayConfig::try_from(cli).is_err());
    }
}
