//! Peer session: drives one client from relay join to a direct, encrypted
//! channel and keeps it there.
//!
//! A session is a single task consuming one input queue. Relay events,
//! transport events, API commands, crypto completions and rejoin timers all
//! arrive on that queue and are handled to completion in order, so session
//! state needs no locks. [`SessionHandle`] is the cloneable front door.

mod machine;
mod media;
mod messaging;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use parley_proto::{
    normalize_join_param, Attachment, ChatMessage, PeerMessage, RefusalCode, RoomJoined, RoomLeft,
};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub use machine::{Action, Input, Machine, SessionState};

use self::{
    media::{removal_notice, removed_kind, LocalMedia},
    messaging::{spawn_crypto_worker, CryptoDone, CryptoJob, Reply},
};
use crate::{
    config::{Backoff, SessionConfig},
    event::{EventChannel, Subscription},
    identity::{Identity, IdentityProvider},
    media::{MediaDeviceProvider, MediaError, MediaRequest, MediaStream, MediaTrack, RemoteMedia, TrackKind},
    signaling::{ConnectionStatus, LinkId, SignalingError, SignalingLink, StatusChange},
    transport::{Role, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportPrimitive},
};

/// Relay signals held while no transport exists yet.
const MAX_PENDING_SIGNALS: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no direct connection to the peer")]
    NotConnected,
    #[error("peer public key has not been received yet")]
    PeerKeyUnknown,
    #[error("session is busy ({0})")]
    Busy(SessionState),
    #[error("message could not be encrypted for the peer")]
    EncryptionFailed,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session has shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        role: Option<Role>,
    },
    SignalingStatus(StatusChange),
    Refused(RefusalCode),
    PeerJoined {
        name: String,
        is_initiator: bool,
    },
    PeerLeft {
        name: String,
    },
    PeerIdentityReceived(Identity),
    TextMessage(ChatMessage),
    LocalTrackAdded {
        kind: TrackKind,
        stream_id: String,
    },
    LocalTrackRemoved {
        kind: TrackKind,
        stream_id: Option<String>,
    },
    RemoteTrackAdded {
        kind: TrackKind,
        track: MediaTrack,
        stream_id: Option<String>,
    },
    RemoteTrackRemoved {
        kind: TrackKind,
    },
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub role: Option<Role>,
    pub room: Option<String>,
    pub peer: Option<Identity>,
    pub local: Option<MediaStream>,
    pub remote: RemoteMedia,
    /// Rejoin attempts since the last successful connection.
    pub rejoin_attempts: u32,
}

/// What a session is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub signaling: Arc<dyn SignalingLink>,
    pub transports: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDeviceProvider>,
}

enum Command {
    Connect {
        url: String,
        room: String,
        reply: Reply<()>,
    },
    SendText {
        content: String,
        attachments: Vec<Attachment>,
        reply: Reply<ChatMessage>,
    },
    AddTrack {
        kind: TrackKind,
        reply: Reply<()>,
    },
    RemoveTrack {
        kind: TrackKind,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

enum RelayEvent {
    Status(StatusChange),
    Joined(RoomJoined),
    Left(RoomLeft),
    Signal(Value),
}

enum SessionInput {
    Command(Command),
    Relay(RelayEvent),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Crypto(CryptoDone),
    MediaAcquired {
        kind: TrackKind,
        result: Result<Vec<MediaTrack>, MediaError>,
        reply: Reply<()>,
    },
    RejoinDue {
        epoch: u64,
    },
}

type Inbox = mpsc::UnboundedSender<SessionInput>;

struct HandleShared {
    inbox: Inbox,
    events: EventChannel<SessionEvent>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        let _ = self
            .inbox
            .send(SessionInput::Command(Command::Shutdown { reply: None }));
    }
}

/// Handle to a running [`PeerSession`]. Dropping the last clone shuts the
/// session down.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<HandleShared>,
}

impl SessionHandle {
    pub fn events(&self) -> &EventChannel<SessionEvent> {
        &self.shared.events
    }

    /// Joins `room` on the relay at `url`. Resolves once the relay link is
    /// open; negotiation continues in the background.
    pub async fn connect(&self, url: &str, room: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect {
            url: url.to_string(),
            room: room.to_string(),
            reply,
        })
        .await?
    }

    /// Encrypts and sends a chat line, returning the local copy.
    pub async fn send_text_message(&self, content: &str) -> Result<ChatMessage, SessionError> {
        self.send_message(content, Vec::new()).await
    }

    /// Like [`Self::send_text_message`], with attachments sealed into the
    /// same payload.
    pub async fn send_message(
        &self,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<ChatMessage, SessionError> {
        self.request(|reply| Command::SendText {
            content: content.to_string(),
            attachments,
            reply,
        })
        .await?
    }

    pub async fn add_audio_stream(&self) -> Result<(), SessionError> {
        self.add_track(TrackKind::Audio).await
    }

    pub async fn add_video_stream(&self) -> Result<(), SessionError> {
        self.add_track(TrackKind::Video).await
    }

    pub async fn remove_audio_stream(&self) -> Result<(), SessionError> {
        self.remove_track(TrackKind::Audio).await
    }

    pub async fn remove_video_stream(&self) -> Result<(), SessionError> {
        self.remove_track(TrackKind::Video).await
    }

    pub async fn add_track(&self, kind: TrackKind) -> Result<(), SessionError> {
        self.request(|reply| Command::AddTrack { kind, reply }).await?
    }

    pub async fn remove_track(&self, kind: TrackKind) -> Result<(), SessionError> {
        self.request(|reply| Command::RemoveTrack { kind, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Tears everything down and waits for the session task to finish.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .shared
            .inbox
            .send(SessionInput::Command(Command::Shutdown { reply: Some(tx) }));
        if sent.is_ok() {
            let _ = rx.await;
        }
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .inbox
            .send(SessionInput::Command(build(tx)))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

pub struct PeerSession {
    deps: Collaborators,
    inbox: Inbox,
    events: EventChannel<SessionEvent>,
    /// Our display name as the relay admits and echoes it.
    member_name: String,
    machine: Machine,
    backoff: Backoff,
    relay_connect_timeout: Duration,
    server: Option<String>,
    room: Option<String>,
    relay_link: Option<LinkId>,
    subscriptions: Vec<Subscription>,
    generation: u64,
    transport: Option<Arc<dyn TransportPrimitive>>,
    pending_signals: VecDeque<Value>,
    crypto: mpsc::UnboundedSender<CryptoJob>,
    peer: Option<Identity>,
    local: LocalMedia,
    remote: RemoteMedia,
    rejoin_epoch: u64,
}

impl PeerSession {
    /// Starts a session task on the current runtime.
    pub fn spawn(deps: Collaborators, config: SessionConfig) -> SessionHandle {
        let (inbox, rx) = mpsc::unbounded_channel();
        let events = EventChannel::new();

        let crypto = {
            let inbox = inbox.clone();
            spawn_crypto_worker(Arc::clone(&deps.identity), move |done| {
                let _ = inbox.send(SessionInput::Crypto(done));
            })
        };
        let subscriptions = subscribe_relay(deps.signaling.as_ref(), &inbox);

        let own = deps.identity.own();
        let session = PeerSession {
            member_name: normalize_join_param(&own.name).to_string(),
            backoff: Backoff::new(config.reconnect.clone()),
            relay_connect_timeout: config.relay_connect_timeout,
            deps,
            inbox: inbox.clone(),
            events: events.clone(),
            machine: Machine::new(),
            server: None,
            room: None,
            relay_link: None,
            subscriptions,
            generation: 0,
            transport: None,
            pending_signals: VecDeque::new(),
            crypto,
            peer: None,
            local: LocalMedia::default(),
            remote: RemoteMedia::default(),
            rejoin_epoch: 0,
        };
        let task = tokio::spawn(session.run(rx));

        SessionHandle {
            shared: Arc::new(HandleShared {
                inbox,
                events,
                task: parking_lot::Mutex::new(Some(task)),
            }),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionInput>) {
        info!(target = "session", name = %self.member_name, "session started");
        while let Some(input) = rx.recv().await {
            match input {
                SessionInput::Command(Command::Shutdown { reply }) => {
                    self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                SessionInput::Command(command) => self.on_command(command).await,
                SessionInput::Relay(event) => self.on_relay(event).await,
                SessionInput::Transport { generation, event } => {
                    if generation == self.generation && self.transport.is_some() {
                        self.on_transport(event).await;
                    } else {
                        debug!(target = "session", generation, current = self.generation, "dropping stale transport event");
                    }
                }
                SessionInput::Crypto(done) => self.on_crypto(done).await,
                SessionInput::MediaAcquired {
                    kind,
                    result,
                    reply,
                } => {
                    let outcome = self.on_media_acquired(kind, result).await;
                    let _ = reply.send(outcome);
                }
                SessionInput::RejoinDue { epoch } => {
                    if epoch == self.rejoin_epoch {
                        self.rejoin().await;
                    }
                }
            }
        }
        info!(target = "session", name = %self.member_name, "session stopped");
    }

    // ---- commands -------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, room, reply } => {
                let _ = reply.send(self.connect(url, room).await);
            }
            Command::SendText {
                content,
                attachments,
                reply,
            } => self.send_text(content, attachments, reply),
            Command::AddTrack { kind, reply } => self.add_track(kind, reply),
            Command::RemoveTrack { kind, reply } => {
                let _ = reply.send(self.remove_track(kind).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn connect(&mut self, url: String, room: String) -> Result<(), SessionError> {
        let state = self.machine.state();
        if !matches!(state, SessionState::Idle | SessionState::Disconnected) {
            return Err(SessionError::Busy(state));
        }
        self.server = Some(url);
        self.room = Some(normalize_join_param(&room).to_string());
        self.rejoin_epoch += 1;
        self.backoff.reset();
        self.apply(Input::JoinRequested).await?;
        Ok(())
    }

    fn send_text(&mut self, content: String, attachments: Vec<Attachment>, reply: Reply<ChatMessage>) {
        if self.machine.state() != SessionState::Connected || self.transport.is_none() {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        }
        let Some(peer) = self.peer.as_ref() else {
            let _ = reply.send(Err(SessionError::PeerKeyUnknown));
            return;
        };
        let job = CryptoJob::Seal {
            generation: self.generation,
            recipient: peer.name.clone(),
            message: ChatMessage {
                attachments,
                ..ChatMessage::local(self.member_name.clone(), content)
            },
            reply,
        };
        if let Err(mpsc::error::SendError(CryptoJob::Seal { reply, .. })) = self.crypto.send(job) {
            let _ = reply.send(Err(SessionError::Closed));
        }
    }

    fn add_track(&mut self, kind: TrackKind, reply: Reply<()>) {
        if self.local.has(kind) {
            let _ = reply.send(Ok(()));
            return;
        }
        // Device prompts can pend indefinitely; keep the queue moving.
        let devices = Arc::clone(&self.deps.devices);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = devices.request_tracks(MediaRequest::only(kind)).await;
            let _ = inbox.send(SessionInput::MediaAcquired {
                kind,
                result,
                reply,
            });
        });
    }

    async fn on_media_acquired(
        &mut self,
        kind: TrackKind,
        result: Result<Vec<MediaTrack>, MediaError>,
    ) -> Result<(), SessionError> {
        let tracks = result.map_err(|err| {
            warn!(target = "session", %kind, error = %err, "media request failed");
            SessionError::Media(err)
        })?;
        for track in tracks {
            let track_kind = track.kind;
            let stream = match self.local.insert(track) {
                Ok(stream) => stream.clone(),
                Err(duplicate) => {
                    self.deps.devices.release(&duplicate);
                    continue;
                }
            };
            if let (Some(transport), Some(attached)) =
                (self.transport.as_ref(), stream.track(track_kind))
            {
                if let Err(err) = transport.add_track(attached, &stream).await {
                    warn!(target = "session", kind = %track_kind, error = %err, "failed to attach local track");
                }
            }
            info!(target = "session", kind = %track_kind, stream = %stream.id, "local track added");
            self.emit(SessionEvent::LocalTrackAdded {
                kind: track_kind,
                stream_id: stream.id.clone(),
            });
        }
        Ok(())
    }

    async fn remove_track(&mut self, kind: TrackKind) -> Result<(), SessionError> {
        let removed = self.local.remove(kind);
        if let Some((tracks, stream)) = &removed {
            for track in tracks {
                if let Some(transport) = self.transport.as_ref() {
                    if let Err(err) = transport.remove_track(track, stream).await {
                        warn!(target = "session", %kind, error = %err, "failed to detach local track");
                    }
                }
                self.deps.devices.release(track);
            }
            if self.machine.state() == SessionState::Connected {
                self.send_direct(&removal_notice(kind)).await;
            }
            info!(target = "session", %kind, "local track removed");
        }
        self.emit(SessionEvent::LocalTrackRemoved {
            kind,
            stream_id: self.local.stream().map(|stream| stream.id.clone()),
        });
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.machine.state(),
            role: self.machine.role(),
            room: self.room.clone(),
            peer: self.peer.clone(),
            local: self.local.stream().cloned(),
            remote: self.remote.clone(),
            rejoin_attempts: self.backoff.attempts(),
        }
    }

    // ---- relay ----------------------------------------------------------

    async fn join_relay(&mut self) -> Result<(), SignalingError> {
        let (Some(server), Some(room)) = (self.server.clone(), self.room.clone()) else {
            return Err(SignalingError::NotConnected);
        };
        info!(target = "session", server = %server, room = %room, name = %self.member_name, "joining relay room");
        let connect = self.deps.signaling.connect(&server, &self.member_name, &room);
        let link = tokio::time::timeout(self.relay_connect_timeout, connect)
            .await
            .map_err(|_| SignalingError::TimedOut)??;
        self.relay_link = Some(link);
        Ok(())
    }

    async fn rejoin(&mut self) {
        if self.machine.state() != SessionState::Disconnected {
            return;
        }
        if let Err(err) = self.apply(Input::JoinRequested).await {
            warn!(target = "session", error = %err, attempt = self.backoff.attempts(), "rejoin failed");
            self.schedule_rejoin();
        }
    }

    fn schedule_rejoin(&mut self) {
        if self.server.is_none() {
            return;
        }
        let Some(delay) = self.backoff.next_delay() else {
            warn!(target = "session", attempts = self.backoff.attempts(), "giving up on rejoin");
            return;
        };
        self.rejoin_epoch += 1;
        let epoch = self.rejoin_epoch;
        let inbox = self.inbox.clone();
        debug!(target = "session", ?delay, attempt = self.backoff.attempts(), "rejoin scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(SessionInput::RejoinDue { epoch });
        });
    }

    async fn on_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Status(change) => self.on_relay_status(change).await,
            RelayEvent::Joined(notice) => {
                if !self.in_room(&notice.room_name) {
                    return;
                }
                let own = notice.name == self.member_name;
                if !own {
                    self.emit(SessionEvent::PeerJoined {
                        name: notice.name.clone(),
                        is_initiator: notice.is_initiator,
                    });
                }
                debug!(target = "session", name = %notice.name, own, is_initiator = notice.is_initiator, "member joined");
                self.step(Input::MemberJoined {
                    own,
                    is_initiator: notice.is_initiator,
                })
                .await;
            }
            RelayEvent::Left(notice) => {
                if !self.in_room(&notice.room_name) {
                    return;
                }
                let own = notice.name == self.member_name;
                if !own {
                    self.emit(SessionEvent::PeerLeft {
                        name: notice.name.clone(),
                    });
                }
                self.step(Input::MemberLeft { own }).await;
            }
            RelayEvent::Signal(data) => self.on_remote_signal(data).await,
        }
    }

    async fn on_relay_status(&mut self, change: StatusChange) {
        self.emit(SessionEvent::SignalingStatus(change.clone()));
        if change.status != ConnectionStatus::Disconnected || self.relay_link != Some(change.link) {
            return;
        }
        self.relay_link = None;
        match change.refusal {
            Some(code) => {
                warn!(target = "session", reason = %code, "relay refused join: {}", code.describe());
                self.emit(SessionEvent::Refused(code));
                self.step(Input::RelayRefused).await;
            }
            None => self.step(Input::RelayLost).await,
        }
    }

    fn in_room(&self, room: &str) -> bool {
        self.room.as_deref() == Some(room)
    }

    async fn on_remote_signal(&mut self, data: Value) {
        match self.transport.as_ref() {
            Some(transport) => {
                if let Err(err) = transport.signal(data).await {
                    warn!(target = "session", error = %err, "transport rejected signal");
                }
            }
            None => {
                if self.pending_signals.len() >= MAX_PENDING_SIGNALS {
                    self.pending_signals.pop_front();
                }
                self.pending_signals.push_back(data);
            }
        }
    }

    // ---- transport ------------------------------------------------------

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(data) => {
                if self.machine.state() == SessionState::Connected {
                    self.send_direct(&PeerMessage::Signal { data }).await;
                } else if let Err(err) = self.deps.signaling.send_signal(data) {
                    warn!(target = "session", error = %err, "failed to relay signal");
                }
            }
            TransportEvent::Connect => self.step(Input::TransportConnected).await,
            TransportEvent::Close => self.step(Input::TransportClosed).await,
            TransportEvent::Error(reason) => {
                warn!(target = "session", %reason, "transport error");
                self.step(Input::TransportFailed).await;
            }
            TransportEvent::Stream { stream_id } => {
                self.remote.stream_id = Some(stream_id);
            }
            TransportEvent::Track { track, stream_id } => {
                let kind = track.kind;
                self.remote.stream_id.get_or_insert(stream_id);
                self.remote.set(track.clone());
                info!(target = "session", %kind, track = %track.id, "remote track added");
                self.emit(SessionEvent::RemoteTrackAdded {
                    kind,
                    track,
                    stream_id: self.remote.stream_id.clone(),
                });
            }
            TransportEvent::Data(bytes) => self.on_peer_message(&bytes).await,
        }
    }

    async fn on_peer_message(&mut self, bytes: &[u8]) {
        let message = match PeerMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(target = "session", error = %err, "dropping direct-channel payload");
                return;
            }
        };
        if let Some(kind) = removed_kind(&message) {
            self.remote.clear(kind);
            info!(target = "session", %kind, "remote track removed");
            self.emit(SessionEvent::RemoteTrackRemoved { kind });
            return;
        }
        match message {
            PeerMessage::Signal { data } => self.on_remote_signal(data).await,
            PeerMessage::TextMessage { author, message } => {
                let _ = self.crypto.send(CryptoJob::Open {
                    author,
                    payload: message,
                });
            }
            PeerMessage::CryptoKey { name, public_key } => {
                let _ = self.crypto.send(CryptoJob::Import {
                    generation: self.generation,
                    name,
                    public_key,
                });
            }
            PeerMessage::RemoteAudioRemoved | PeerMessage::RemoteVideoRemoved => {}
        }
    }

    async fn send_direct(&self, message: &PeerMessage) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "session", kind = message.kind(), error = %err, "failed to encode direct message");
                return;
            }
        };
        if let Err(err) = transport.send(Bytes::from(payload)).await {
            warn!(target = "session", kind = message.kind(), error = %err, "direct send failed");
        }
    }

    // ---- crypto ---------------------------------------------------------

    async fn on_crypto(&mut self, done: CryptoDone) {
        match done {
            CryptoDone::Imported { generation, result } => {
                if generation != self.generation {
                    return;
                }
                match result {
                    Ok(identity) => {
                        info!(target = "session", peer = %identity.name, "peer key received");
                        self.peer = Some(identity.clone());
                        self.emit(SessionEvent::PeerIdentityReceived(identity));
                    }
                    Err(err) => warn!(target = "session", error = %err, "rejecting peer key"),
                }
            }
            CryptoDone::Sealed {
                generation,
                message,
                payload,
                reply,
            } => {
                let outcome = match payload {
                    None => Err(SessionError::EncryptionFailed),
                    Some(_)
                        if generation != self.generation
                            || self.machine.state() != SessionState::Connected =>
                    {
                        Err(SessionError::NotConnected)
                    }
                    Some(payload) => {
                        self.send_direct(&PeerMessage::TextMessage {
                            author: message.author.clone(),
                            message: payload,
                        })
                        .await;
                        Ok(message)
                    }
                };
                let _ = reply.send(outcome);
            }
            CryptoDone::Opened(message) => self.emit(SessionEvent::TextMessage(message)),
        }
    }

    // ---- state machine --------------------------------------------------

    /// Feeds `input` to the machine and carries out the resulting actions.
    /// Only a failed relay join is reported back; the machine has already
    /// been halted when that happens.
    async fn apply(&mut self, input: Input) -> Result<(), SignalingError> {
        let mut next = Some(input);
        while let Some(input) = next.take() {
            let before = (self.machine.state(), self.machine.role());
            let action = self.machine.apply(input);
            if (self.machine.state(), self.machine.role()) != before {
                debug!(target = "session", ?input, from = %before.0, to = %self.machine.state(), "state transition");
                self.emit_state();
            }
            match action {
                Action::None => {}
                Action::JoinRelay => {
                    if let Err(err) = self.join_relay().await {
                        self.machine.halt();
                        self.emit_state();
                        return Err(err);
                    }
                }
                Action::CreateTransport(role) => {
                    if let Err(err) = self.create_transport(role).await {
                        warn!(target = "session", ?role, error = %err, "failed to create transport");
                        next = Some(Input::TransportFailed);
                    }
                }
                Action::PromoteToDirect => self.promote_to_direct().await,
                Action::AbandonNegotiation => self.drop_transport().await,
                Action::TearDown { rejoin } => {
                    self.tear_down().await;
                    if rejoin {
                        self.schedule_rejoin();
                    }
                }
            }
        }
        Ok(())
    }

    /// [`Self::apply`] for inputs that never ask for a relay join.
    async fn step(&mut self, input: Input) {
        if let Err(err) = self.apply(input).await {
            warn!(target = "session", ?input, error = %err, "relay join failed");
        }
    }

    async fn create_transport(&mut self, role: Role) -> Result<(), TransportError> {
        self.generation += 1;
        let inbox = self.inbox.clone();
        let events = TransportEvents::new(self.generation, move |generation, event| {
            let _ = inbox.send(SessionInput::Transport { generation, event });
        });
        let transport = self.deps.transports.create(role, events).await?;
        info!(target = "session", ?role, generation = self.generation, "transport created");

        if let Some(stream) = self.local.stream() {
            if let Err(err) = transport.add_stream(stream).await {
                warn!(target = "session", error = %err, "failed to attach local stream");
            }
        }
        while let Some(signal) = self.pending_signals.pop_front() {
            if let Err(err) = transport.signal(signal).await {
                warn!(target = "session", error = %err, "transport rejected queued signal");
            }
        }
        self.transport = Some(transport);
        Ok(())
    }

    async fn promote_to_direct(&mut self) {
        if let Some(link) = self.relay_link.take() {
            debug!(target = "session", link, "direct channel open, leaving relay");
            self.deps.signaling.close();
        }
        self.backoff.reset();
        let public_key = self.deps.identity.export_public_key().await;
        self.send_direct(&PeerMessage::CryptoKey {
            name: self.member_name.clone(),
            public_key,
        })
        .await;
        info!(target = "session", name = %self.member_name, "connected to peer");
    }

    /// Destroys the live transport and forgets everything learned through it.
    async fn drop_transport(&mut self) {
        self.generation += 1;
        self.pending_signals.clear();
        if let Some(transport) = self.transport.take() {
            transport.destroy().await;
        }
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if self.remote.clear(kind) {
                self.emit(SessionEvent::RemoteTrackRemoved { kind });
            }
        }
        self.remote = RemoteMedia::default();
        if let Some(peer) = self.peer.take() {
            self.deps.identity.forget(&peer.name);
        }
    }

    async fn tear_down(&mut self) {
        self.drop_transport().await;
        if self.relay_link.take().is_some() {
            self.deps.signaling.close();
        }
    }

    async fn shutdown(&mut self) {
        self.rejoin_epoch += 1;
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.tear_down().await;
        self.deps.signaling.close();
        for track in self.local.drain() {
            self.deps.devices.release(&track);
        }
        if self.machine.state() != SessionState::Idle {
            self.machine.halt();
            self.emit_state();
        }
    }

    fn emit_state(&self) {
        self.emit(SessionEvent::StateChanged {
            state: self.machine.state(),
            role: self.machine.role(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(&event);
    }
}

fn subscribe_relay(signaling: &dyn SignalingLink, inbox: &Inbox) -> Vec<Subscription> {
    let events = signaling.events();
    let status = {
        let inbox = inbox.clone();
        events.status.subscribe(move |change: &StatusChange| {
            let _ = inbox.send(SessionInput::Relay(RelayEvent::Status(change.clone())));
        })
    };
    let joined = {
        let inbox = inbox.clone();
        events.room_joined.subscribe(move |notice: &RoomJoined| {
            let _ = inbox.send(SessionInput::Relay(RelayEvent::Joined(notice.clone())));
        })
    };
    let left = {
        let inbox = inbox.clone();
        events.room_left.subscribe(move |notice: &RoomLeft| {
            let _ = inbox.send(SessionInput::Relay(RelayEvent::Left(notice.clone())));
        })
    };
    let signal = {
        let inbox = inbox.clone();
        events.peer_signal.subscribe(move |data: &Value| {
            let _ = inbox.send(SessionInput::Relay(RelayEvent::Signal(data.clone())));
        })
    };
    vec![status, joined, left, signal]
}
