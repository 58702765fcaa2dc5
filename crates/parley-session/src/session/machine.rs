//! Negotiation state machine.
//!
//! Pure transition table: the session feeds it one [`Input`] at a time and
//! carries out the returned [`Action`]. Nothing here touches I/O.

use crate::transport::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    /// Joined (or joining) the relay room, no transport yet.
    AwaitingPeer,
    /// A transport exists and is exchanging signals.
    Negotiating,
    /// The direct channel is open; the relay link has been dropped.
    Connected,
    Disconnected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingPeer => "awaiting_peer",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Explicit connect or a due rejoin.
    JoinRequested,
    /// A `roomJoined` notice. `own` is set for the self-notice.
    MemberJoined { own: bool, is_initiator: bool },
    MemberLeft { own: bool },
    TransportConnected,
    TransportClosed,
    TransportFailed,
    RelayRefused,
    RelayLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    JoinRelay,
    CreateTransport(Role),
    PromoteToDirect,
    /// Drop the half-built transport but keep the relay link.
    AbandonNegotiation,
    TearDown { rejoin: bool },
}

#[derive(Debug, Clone)]
pub struct Machine {
    state: SessionState,
    role: Option<Role>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            role: None,
        }
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Role adopted from the latest self-notice, if any.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn apply(&mut self, input: Input) -> Action {
        use SessionState::*;

        match (self.state, input) {
            (Idle | Disconnected, Input::JoinRequested) => {
                self.role = None;
                self.state = AwaitingPeer;
                Action::JoinRelay
            }

            (AwaitingPeer, Input::MemberJoined { own: true, is_initiator }) => {
                self.role = Some(if is_initiator {
                    Role::Initiator
                } else {
                    Role::Responder
                });
                if is_initiator {
                    // The initiator's own notice arrives first; the offer waits
                    // for the peer's notice.
                    Action::None
                } else {
                    self.state = Negotiating;
                    Action::CreateTransport(Role::Responder)
                }
            }
            (AwaitingPeer, Input::MemberJoined { own: false, .. }) => match self.role {
                Some(Role::Initiator) => {
                    self.state = Negotiating;
                    Action::CreateTransport(Role::Initiator)
                }
                _ => Action::None,
            },

            (Negotiating, Input::MemberLeft { own: false }) => {
                self.state = AwaitingPeer;
                Action::AbandonNegotiation
            }

            (Negotiating, Input::TransportConnected) => {
                self.state = Connected;
                Action::PromoteToDirect
            }
            (Negotiating | Connected, Input::TransportClosed | Input::TransportFailed) => {
                self.disconnect();
                Action::TearDown { rejoin: true }
            }

            (AwaitingPeer | Negotiating, Input::RelayRefused) => {
                self.disconnect();
                Action::TearDown { rejoin: false }
            }
            (AwaitingPeer | Negotiating, Input::RelayLost) => {
                self.disconnect();
                Action::TearDown { rejoin: true }
            }

            _ => Action::None,
        }
    }

    /// Forces the machine into `Disconnected` without a rejoin, as on shutdown.
    pub fn halt(&mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.role = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined() -> Machine {
        let mut machine = Machine::new();
        assert_eq!(machine.apply(Input::JoinRequested), Action::JoinRelay);
        machine
    }

    #[test_timeout::timeout]
    fn initiator_waits_for_peer_notice() {
        let mut machine = joined();
        assert_eq!(
            machine.apply(Input::MemberJoined {
                own: true,
                is_initiator: true
            }),
            Action::None
        );
        assert_eq!(machine.state(), SessionState::AwaitingPeer);
        assert_eq!(machine.role(), Some(Role::Initiator));

        assert_eq!(
            machine.apply(Input::MemberJoined {
                own: false,
                is_initiator: false
            }),
            Action::CreateTransport(Role::Initiator)
        );
        assert_eq!(machine.state(), SessionState::Negotiating);
    }

    #[test_timeout::timeout]
    fn responder_ignores_peer_notice_and_builds_on_own() {
        let mut machine = joined();
        assert_eq!(
            machine.apply(Input::MemberJoined {
                own: false,
                is_initiator: true
            }),
            Action::None
        );
        assert_eq!(
            machine.apply(Input::MemberJoined {
                own: true,
                is_initiator: false
            }),
            Action::CreateTransport(Role::Responder)
        );
        assert_eq!(machine.role(), Some(Role::Responder));
    }

    #[test_timeout::timeout]
    fn only_one_transport_per_negotiation() {
        let mut machine = joined();
        machine.apply(Input::MemberJoined {
            own: true,
            is_initiator: true,
        });
        machine.apply(Input::MemberJoined {
            own: false,
            is_initiator: false,
        });
        for own in [true, false] {
            assert_eq!(
                machine.apply(Input::MemberJoined {
                    own,
                    is_initiator: true
                }),
                Action::None
            );
        }
        assert_eq!(machine.apply(Input::TransportConnected), Action::PromoteToDirect);
        assert_eq!(
            machine.apply(Input::MemberJoined {
                own: false,
                is_initiator: false
            }),
            Action::None
        );
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test_timeout::timeout]
    fn peer_leaving_mid_negotiation_returns_to_waiting() {
        let mut machine = joined();
        machine.apply(Input::MemberJoined {
            own: true,
            is_initiator: false,
        });
        assert_eq!(
            machine.apply(Input::MemberLeft { own: false }),
            Action::AbandonNegotiation
        );
        assert_eq!(machine.state(), SessionState::AwaitingPeer);

        // Promotion after the initiator left.
        assert_eq!(
            machine.apply(Input::MemberJoined {
                own: true,
                is_initiator: true
            }),
            Action::None
        );
        assert_eq!(machine.role(), Some(Role::Initiator));
    }

    #[test_timeout::timeout]
    fn transport_loss_rejoins_but_refusal_does_not() {
        let mut machine = joined();
        machine.apply(Input::MemberJoined {
            own: true,
            is_initiator: false,
        });
        machine.apply(Input::TransportConnected);
        assert_eq!(
            machine.apply(Input::TransportFailed),
            Action::TearDown { rejoin: true }
        );
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert_eq!(machine.role(), None);

        assert_eq!(machine.apply(Input::JoinRequested), Action::JoinRelay);
        assert_eq!(
            machine.apply(Input::RelayRefused),
            Action::TearDown { rejoin: false }
        );
        assert_eq!(machine.state(), SessionState::Disconnected);
    }

    #[test_timeout::timeout]
    fn relay_loss_after_connect_is_expected() {
        let mut machine = joined();
        machine.apply(Input::MemberJoined {
            own: true,
            is_initiator: false,
        });
        machine.apply(Input::TransportConnected);
        assert_eq!(machine.apply(Input::RelayLost), Action::None);
        assert_eq!(machine.apply(Input::MemberLeft { own: false }), Action::None);
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test_timeout::timeout]
    fn join_requests_ignored_while_active() {
        let mut machine = joined();
        assert_eq!(machine.apply(Input::JoinRequested), Action::None);
        assert_eq!(machine.apply(Input::TransportClosed), Action::None);
        assert_eq!(machine.state(), SessionState::AwaitingPeer);
    }
}
