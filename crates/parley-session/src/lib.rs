//! Client side of Parley: relay signaling, the peer session state machine,
//! encrypted messaging and media-track lifecycle over a direct transport.

pub mod config;
pub mod event;
pub mod identity;
pub mod media;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{ReconnectPolicy, SessionConfig};
pub use event::{EventChannel, EventStream, Subscription};
pub use identity::{Identity, IdentityError, IdentityProvider, SealedBoxIdentity};
pub use media::{
    MediaDeviceProvider, MediaError, MediaRequest, MediaStream, MediaTrack, RemoteMedia,
    SyntheticDevices, TrackKind,
};
pub use session::{
    Collaborators, PeerSession, SessionError, SessionEvent, SessionHandle, SessionSnapshot,
    SessionState,
};
pub use signaling::{
    ConnectionStatus, LinkId, SignalingClient, SignalingError, SignalingEvents, SignalingLink,
    StatusChange,
};
pub use transport::{
    loopback::LoopbackNetwork,
    webrtc::{WebRtcConfig, WebRtcTransportFactory},
    Role, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportPrimitive,
};
