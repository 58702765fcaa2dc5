mod cli;
mod console;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_session::{
    Collaborators, PeerSession, SealedBoxIdentity, SessionHandle, SignalingClient,
    SyntheticDevices, WebRtcTransportFactory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::{
    cli::{Cli, ClientConfig},
    console::{parse_line, render_event, render_message, ConsoleCommand, HELP},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::try_from(Cli::parse()).context("invalid arguments")?;
    logging::init(&config.logging).context("failed to initialise logging")?;

    let session = PeerSession::spawn(
        Collaborators {
            identity: Arc::new(SealedBoxIdentity::generate(config.name.clone())),
            signaling: Arc::new(SignalingClient::new(config.session.relay_connect_timeout)),
            transports: Arc::new(WebRtcTransportFactory::new(config.webrtc.clone())),
            devices: Arc::new(SyntheticDevices::new()),
        },
        config.session.clone(),
    );
    let _printer = session.events().subscribe(|event| {
        if let Some(line) = render_event(event) {
            println!("{line}");
        }
    });

    info!(server = %config.server, room = %config.room, name = %config.name, "starting parley");
    session
        .connect(&config.server, &config.room)
        .await
        .with_context(|| format!("failed to reach relay at {}", config.server))?;
    println!("joined room `{}` as {}; /help for commands", config.room, config.name);

    tokio::select! {
        result = input_loop(&session) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    session.shutdown().await;
    Ok(())
}

async fn input_loop(session: &SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match parse_line(&line) {
            None => continue,
            Some(Ok(command)) => command,
            Some(Err(err)) => {
                println!("{err}");
                continue;
            }
        };
        match command {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Status => match session.snapshot().await {
                Ok(view) => println!(
                    "state: {} | peer: {} | sending: {}",
                    view.state,
                    view.peer.map(|p| p.name).unwrap_or_else(|| "none".into()),
                    view.local
                        .map(|stream| stream
                            .tracks()
                            .iter()
                            .map(|track| track.kind.as_str())
                            .collect::<Vec<_>>()
                            .join("+"))
                        .filter(|kinds| !kinds.is_empty())
                        .unwrap_or_else(|| "nothing".into()),
                ),
                Err(err) => warn!(error = %err, "snapshot failed"),
            },
            ConsoleCommand::Say(content) => {
                match session.send_text_message(&content).await {
                    Ok(message) => println!("{}", render_message(&message)),
                    Err(err) => println!("not sent: {err}"),
                }
            }
            ConsoleCommand::Media { kind, enable } => {
                let result = if enable {
                    session.add_track(kind).await
                } else {
                    session.remove_track(kind).await
                };
                if let Err(err) = result {
                    println!("{kind}: {err}");
                }
            }
        }
    }
    Ok(())
}
