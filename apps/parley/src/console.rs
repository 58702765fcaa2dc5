//! Line-oriented input and rendering for the terminal client.

use chrono::{DateTime, Local};
use parley_proto::{ChatMessage, MessageOrigin};
use parley_session::{ConnectionStatus, SessionEvent, SessionState, TrackKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Say(String),
    Media { kind: TrackKind, enable: bool },
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnknownCommand(String),
    Usage(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownCommand(name) => write!(f, "unknown command /{name}; try /help"),
            ParseError::Usage(usage) => write!(f, "usage: {usage}"),
        }
    }
}

pub const HELP: &str = "\
/audio on|off   start or stop sending audio
/video on|off   start or stop sending video
/status         show the session state
/quit           leave
anything else is sent as a chat message";

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Result<ConsoleCommand, ParseError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(ConsoleCommand::Say(line.to_string())));
    };
    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let arg = words.next();
    let command = match name {
        "audio" | "video" => {
            let kind = if name == "audio" {
                TrackKind::Audio
            } else {
                TrackKind::Video
            };
            match arg {
                Some("on") => Ok(ConsoleCommand::Media { kind, enable: true }),
                Some("off") => Ok(ConsoleCommand::Media {
                    kind,
                    enable: false,
                }),
                _ => Err(ParseError::Usage("/audio|/video on|off")),
            }
        }
        "status" => Ok(ConsoleCommand::Status),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    };
    Some(command)
}

pub fn render_message(message: &ChatMessage) -> String {
    let time = DateTime::from_timestamp_millis(message.date)
        .map(|at| at.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let mut line = match message.origin {
        MessageOrigin::Internal => format!("[{time}] * {}", message.content),
        MessageOrigin::Local | MessageOrigin::Remote => {
            format!("[{time}] <{}> {}", message.author, message.content)
        }
    };
    for attachment in &message.attachments {
        line.push_str(&format!(" [{}]", attachment.identifier));
    }
    line
}

/// Status line for events worth showing; chat lines are rendered separately.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::StateChanged { state, .. } => match state {
            SessionState::AwaitingPeer => "waiting for a peer to join".to_string(),
            SessionState::Negotiating => "negotiating a direct connection".to_string(),
            SessionState::Connected => "connected directly to peer".to_string(),
            SessionState::Disconnected => "disconnected".to_string(),
            SessionState::Idle => return None,
        },
        SessionEvent::SignalingStatus(change) => match change.status {
            ConnectionStatus::Connecting => "contacting relay".to_string(),
            ConnectionStatus::Connected | ConnectionStatus::Disconnected => return None,
        },
        SessionEvent::Refused(code) => format!("relay refused to admit us: {}", code.describe()),
        SessionEvent::PeerJoined { name, .. } => format!("{name} joined the room"),
        SessionEvent::PeerLeft { name } => format!("{name} left the room"),
        SessionEvent::PeerIdentityReceived(identity) => {
            format!("messages to {} are now end-to-end encrypted", identity.name)
        }
        SessionEvent::TextMessage(message) => render_message(message),
        SessionEvent::LocalTrackAdded { kind, .. } => format!("sending {kind}"),
        SessionEvent::LocalTrackRemoved { kind, .. } => format!("stopped sending {kind}"),
        SessionEvent::RemoteTrackAdded { kind, .. } => format!("peer started sending {kind}"),
        SessionEvent::RemoteTrackRemoved { kind } => format!("peer stopped sending {kind}"),
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_proto::{Attachment, AttachmentKind, RefusalCode};

    #[test_timeout::timeout]
    fn plain_lines_are_chat() {
        assert_eq!(
            parse_line("  hello there "),
            Some(Ok(ConsoleCommand::Say("hello there".into())))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test_timeout::timeout]
    fn slash_commands_parse() {
        assert_eq!(
            parse_line("/audio on"),
            Some(Ok(ConsoleCommand::Media {
                kind: TrackKind::Audio,
                enable: true
            }))
        );
        assert_eq!(
            parse_line("/video off"),
            Some(Ok(ConsoleCommand::Media {
                kind: TrackKind::Video,
                enable: false
            }))
        );
        assert_eq!(parse_line("/quit"), Some(Ok(ConsoleCommand::Quit)));
        assert_eq!(
            parse_line("/video"),
            Some(Err(ParseError::Usage("/audio|/video on|off")))
        );
        assert_eq!(
            parse_line("/dance"),
            Some(Err(ParseError::UnknownCommand("dance".into())))
        );
    }

    #[test_timeout::timeout]
    fn events_render_for_humans() {
        assert_eq!(
            render_event(&SessionEvent::Refused(RefusalCode::RoomFull)).as_deref(),
            Some("relay refused to admit us: room already has two members")
        );
        assert_eq!(
            render_event(&SessionEvent::RemoteTrackRemoved {
                kind: TrackKind::Video
            })
            .as_deref(),
            Some("peer stopped sending video")
        );
        let line = render_message(&ChatMessage::local("alice", "hi"));
        assert!(line.ends_with("<alice> hi"));

        let with_image = ChatMessage::local("bob", "look").with_attachment(Attachment {
            identifier: "cat.png".into(),
            kind: AttachmentKind::Image,
            data: "iVBORw0KGgo=".into(),
        });
        assert!(render_message(&with_image).ends_with("<bob> look [cat.png]"));
    }
}
