use std::{path::PathBuf, time::Duration};

use clap::Parser;
use parley_session::{ReconnectPolicy, SessionConfig, WebRtcConfig};
use thiserror::Error;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug, Clone)]
#[command(name = "parley", about = "Encrypted peer-to-peer chat over a signaling relay")]
pub struct Cli {
    /// Relay websocket endpoint.
    #[arg(long, env = "PARLEY_SERVER", default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,

    #[arg(long, env = "PARLEY_ROOM")]
    pub room: String,

    /// Display name; must be unique within the room.
    #[arg(long, env = "PARLEY_NAME")]
    pub name: String,

    /// STUN/TURN urls. Repeat for several.
    #[arg(long = "ice-server", env = "PARLEY_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Give up after this many failed rejoins. Unlimited when absent.
    #[arg(long, env = "PARLEY_MAX_REJOIN_ATTEMPTS")]
    pub max_rejoin_attempts: Option<u32>,

    #[arg(long, env = "PARLEY_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Write logs here instead of stderr.
    #[arg(long, env = "PARLEY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, env = "PARLEY_LOG_LEVEL", value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("--{0} must not be blank")]
    Blank(&'static str),
    #[error("--connect-timeout-secs must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub room: String,
    pub name: String,
    pub session: SessionConfig,
    pub webrtc: WebRtcConfig,
    pub logging: LogConfig,
}

impl TryFrom<Cli> for ClientConfig {
    type Error = CliError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let room = non_blank(cli.room, "room")?;
        let name = non_blank(cli.name, "name")?;
        let server = non_blank(cli.server, "server")?;
        if cli.connect_timeout_secs == 0 {
            return Err(CliError::ZeroTimeout);
        }

        let mut webrtc = WebRtcConfig::default();
        let ice_servers: Vec<String> = cli
            .ice_servers
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if !ice_servers.is_empty() {
            webrtc.ice_servers = ice_servers;
        }

        Ok(Self {
            server,
            room,
            name,
            session: SessionConfig {
                relay_connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
                reconnect: ReconnectPolicy {
                    max_attempts: cli.max_rejoin_attempts,
                    ..ReconnectPolicy::default()
                },
            },
            webrtc,
            logging: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
        })
    }
}

fn non_blank(value: String, flag: &'static str) -> Result<String, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CliError::Blank(flag));
    }
    Ok(trimmed.to_string())
}
