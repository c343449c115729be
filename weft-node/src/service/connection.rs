//! Transport connection state machines.
use std::fmt;

use weft::Identity;

use crate::service::io::Outbox;
use crate::service::message::Message;
use crate::service::DisconnectReason;
use crate::Link;

/// Handle identifying one transport session at the adapter layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The transport class of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Dialed with an address, eg. a socket.
    Direct,
    /// Established through broker-relayed signalling.
    Assisted,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Assisted => write!(f, "assisted"),
        }
    }
}

/// Connection state. One variant active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Transport handshake outstanding.
    Connecting,
    /// Transport is up and our identity has been written; the remote's
    /// identity message is expected next.
    WaitingForIdentity,
    /// A signalling request is outbound via a broker. Assisted only.
    RequestSignaling,
    /// Exchanging signalling payloads via a broker. Assisted only.
    Signaling,
    /// Fully authenticated. Application traffic permitted.
    Connected { identity: Identity },
    /// Terminal for this connection instance.
    Disconnected,
}

impl State {
    /// Whether a frame may be written in this state.
    pub fn can_send(&self) -> bool {
        matches!(self, Self::WaitingForIdentity | Self::Connected { .. })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::WaitingForIdentity => write!(f, "waiting-for-identity"),
            Self::RequestSignaling => write!(f, "request-signaling"),
            Self::Signaling => write!(f, "signaling"),
            Self::Connected { .. } => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// The transition table. Everything not listed here is a bug.
fn is_valid_transition(from: &State, to: &State) -> bool {
    use State::*;

    matches!(
        (from, to),
        (
            Connecting,
            WaitingForIdentity | Signaling | RequestSignaling | Disconnected
        ) | (RequestSignaling, Signaling | Disconnected)
            | (Signaling, WaitingForIdentity | Disconnected)
            | (WaitingForIdentity, Connected { .. } | Disconnected)
            | (Connected { .. }, Disconnected)
    )
}

/// One transport session to a peer. A peer holds at most one of each kind.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Transport session handle.
    pub id: ConnectionId,
    /// Transport class.
    pub kind: ConnectionKind,
    /// Connection direction.
    pub link: Link,
    /// Connection state.
    pub state: State,
    /// Whether we open the assisted session. Meaningless for direct
    /// connections.
    pub initiator: bool,
    /// The peer relaying our signalling payloads. Assisted only.
    pub broker: Option<Identity>,
    /// Whether the assisted transport session has been created.
    opened: bool,
    /// Frames written.
    sent: usize,
    /// Frames refused by the send admission rule.
    dropped: usize,
}

impl Connection {
    pub fn direct(id: ConnectionId, link: Link) -> Self {
        Self {
            id,
            kind: ConnectionKind::Direct,
            link,
            state: State::Connecting,
            initiator: false,
            broker: None,
            opened: false,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn assisted(id: ConnectionId, link: Link, initiator: bool, broker: Identity) -> Self {
        Self {
            id,
            kind: ConnectionKind::Assisted,
            link,
            state: State::Connecting,
            initiator,
            broker: Some(broker),
            opened: false,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, State::Disconnected)
    }

    /// The authenticated identity, if the connection completed its handshake.
    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            State::Connected { identity } => Some(identity),
            _ => None,
        }
    }

    /// Frames written so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Frames refused by the admission rule so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Whether the assisted session was created at the transport layer.
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Mark the assisted session created. Called exactly once.
    pub fn open(&mut self) {
        debug_assert!(!self.opened, "Connection::open: session already created");
        self.opened = true;
    }

    /// Transition to a new state. Transitions not in the table are bugs.
    pub fn set_state(&mut self, state: State) {
        assert!(
            is_valid_transition(&self.state, &state),
            "Connection::set_state: invalid transition for {}: {} -> {}",
            self.id,
            self.state,
            state
        );
        log::trace!(target: "service", "{}: {} -> {}", self.id, self.state, state);

        self.state = state;
    }

    /// Write a frame, subject to the admission rule: frames are admitted
    /// only while waiting for the remote identity or fully connected.
    /// Returns whether the frame was admitted.
    pub fn send(&mut self, outbox: &mut Outbox, msg: Message) -> bool {
        if self.state.can_send() {
            outbox.write(self.id, msg);
            self.sent += 1;

            true
        } else {
            log::trace!(
                target: "service",
                "{}: dropping {:?} in state {}", self.id, msg, self.state
            );
            self.dropped += 1;

            false
        }
    }

    /// Force the connection into its terminal state and release the
    /// transport handle. Idempotent.
    pub fn close(&mut self, outbox: &mut Outbox, reason: DisconnectReason) {
        if self.is_disconnected() {
            return;
        }
        outbox.disconnect(self.id, reason);
        self.set_state(State::Disconnected);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}, {})", self.kind, self.id, self.link, self.state)
    }
}
