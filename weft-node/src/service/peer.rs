//! Peer records.
use std::fmt;

use weft::collections::RandomSet;
use weft::{Identity, Version};

use crate::clock::Timestamp;
use crate::service::connection::{Connection, ConnectionId, ConnectionKind};
use crate::service::io::Outbox;
use crate::service::message;
use crate::service::retry::Retry;
use crate::service::DisconnectReason;
use crate::Link;

/// Stable handle to a peer record. Remains valid for the life of the
/// record, including across identity changes; resolves to nothing once
/// the record is disposed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Peer state, derived from the states of the peer's connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// No live connection.
    Disconnected,
    /// At least one connection exists, none fully connected yet.
    Connecting,
    /// At least one connection is fully connected.
    Connected { identity: Identity },
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected { .. } => write!(f, "connected"),
        }
    }
}

/// A requested quiet period: no connections before `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectWindow {
    pub reason: message::DisconnectReason,
    pub until: Timestamp,
}

/// Retry state per (transport, direction).
#[derive(Debug, Default, Clone)]
struct Retries {
    direct_inbound: Retry,
    direct_outbound: Retry,
    assisted_inbound: Retry,
    assisted_outbound: Retry,
}

/// A remote node record. May or may not have been identified.
#[derive(Debug)]
pub struct Peer {
    /// Registry handle.
    pub id: PeerId,
    /// The remote's identity, once learned.
    pub identity: Option<Identity>,
    /// Display name advertised by the remote.
    pub name: Option<String>,
    /// Address the remote accepts direct connections on.
    pub address: Option<String>,
    /// Port the remote accepts direct connections on.
    pub port: Option<u16>,
    /// Version advertised by the remote.
    pub version: Option<Version>,
    /// Whether the remote is a worker node.
    pub is_worker: bool,
    /// Whether the remote is exempt from dial cooldowns.
    pub whitelisted: bool,
    /// We asked the remote to stay away until this window expires.
    pub local_disconnect: Option<DisconnectWindow>,
    /// The remote asked us to stay away until this window expires.
    pub peer_disconnect: Option<DisconnectWindow>,

    /// Identities of peers the remote told us it is connected to.
    known_peers: RandomSet<Identity>,
    /// Direct transport slot.
    direct: Option<Connection>,
    /// Assisted transport slot.
    assisted: Option<Connection>,
    /// Dial cooldowns.
    retries: Retries,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            identity: None,
            name: None,
            address: None,
            port: None,
            version: None,
            is_worker: false,
            whitelisted: false,
            local_disconnect: None,
            peer_disconnect: None,
            known_peers: RandomSet::default(),
            direct: None,
            assisted: None,
            retries: Retries::default(),
        }
    }

    /// The monotonic join of the connection states.
    pub fn state(&self) -> PeerState {
        for conn in self.connections() {
            if let Some(identity) = conn.identity() {
                return PeerState::Connected {
                    identity: *identity,
                };
            }
        }
        if self.connections().next().is_some() {
            PeerState::Connecting
        } else {
            PeerState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), PeerState::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state(), PeerState::Disconnected)
    }

    /// Live connections, direct first.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.direct.iter().chain(self.assisted.iter())
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.direct.iter_mut().chain(self.assisted.iter_mut())
    }

    pub fn connection(&self, kind: ConnectionKind) -> Option<&Connection> {
        match kind {
            ConnectionKind::Direct => self.direct.as_ref(),
            ConnectionKind::Assisted => self.assisted.as_ref(),
        }
    }

    pub fn connection_mut(&mut self, kind: ConnectionKind) -> Option<&mut Connection> {
        match kind {
            ConnectionKind::Direct => self.direct.as_mut(),
            ConnectionKind::Assisted => self.assisted.as_mut(),
        }
    }

    /// Find the transport class of one of our connections.
    pub fn kind_of(&self, id: ConnectionId) -> Option<ConnectionKind> {
        self.connections()
            .find(|c| c.id == id)
            .map(|c| c.kind)
    }

    /// Install a connection in its transport slot, closing any previously
    /// installed connection first. Returns the displaced connection.
    pub fn install(
        &mut self,
        outbox: &mut Outbox,
        conn: Connection,
        displaced: DisconnectReason,
    ) -> Option<Connection> {
        let slot = match conn.kind {
            ConnectionKind::Direct => &mut self.direct,
            ConnectionKind::Assisted => &mut self.assisted,
        };
        let previous = slot.replace(conn);

        if let Some(mut previous) = previous {
            previous.close(outbox, displaced);

            return Some(previous);
        }
        None
    }

    /// Detach a connection from its slot without closing it.
    pub fn detach(&mut self, kind: ConnectionKind) -> Option<Connection> {
        match kind {
            ConnectionKind::Direct => self.direct.take(),
            ConnectionKind::Assisted => self.assisted.take(),
        }
    }

    pub fn retry(&self, kind: ConnectionKind, link: Link) -> &Retry {
        match (kind, link) {
            (ConnectionKind::Direct, Link::Inbound) => &self.retries.direct_inbound,
            (ConnectionKind::Direct, Link::Outbound) => &self.retries.direct_outbound,
            (ConnectionKind::Assisted, Link::Inbound) => &self.retries.assisted_inbound,
            (ConnectionKind::Assisted, Link::Outbound) => &self.retries.assisted_outbound,
        }
    }

    pub fn retry_mut(&mut self, kind: ConnectionKind, link: Link) -> &mut Retry {
        match (kind, link) {
            (ConnectionKind::Direct, Link::Inbound) => &mut self.retries.direct_inbound,
            (ConnectionKind::Direct, Link::Outbound) => &mut self.retries.direct_outbound,
            (ConnectionKind::Assisted, Link::Inbound) => &mut self.retries.assisted_inbound,
            (ConnectionKind::Assisted, Link::Outbound) => &mut self.retries.assisted_outbound,
        }
    }

    /// Identities the remote told us it is connected to.
    pub fn known_peers(&self) -> impl Iterator<Item = &Identity> {
        self.known_peers.iter()
    }

    pub fn knows(&self, identity: &Identity) -> bool {
        self.known_peers.contains(identity)
    }

    /// Record a neighbour edge. Idempotent; returns whether it was new.
    pub fn add_known_peer(&mut self, identity: Identity) -> bool {
        self.known_peers.insert(identity)
    }

    /// Remove a neighbour edge. Idempotent; returns whether it existed.
    pub fn remove_known_peer(&mut self, identity: &Identity) -> bool {
        self.known_peers.remove(identity)
    }

    /// Drop all neighbour edges.
    pub fn clear_known_peers(&mut self) {
        self.known_peers.clear();
    }

    /// Stable human label. Used only in diagnostics.
    pub fn display_name(&self) -> String {
        match (&self.identity, &self.name) {
            (Some(identity), Some(name)) => format!("{name}@{}", identity.short()),
            (Some(identity), None) => identity.short(),
            (None, _) => match (&self.address, self.port) {
                (Some(address), Some(port)) => format!("{address}:{port}"),
                (Some(address), None) => address.clone(),
                (None, _) => self.id.to_string(),
            },
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::connection::State;
    use crate::service::io::Io;

    #[test]
    fn test_state_is_join_of_connections() {
        let mut peer = Peer::new(PeerId(1));
        assert_eq!(peer.state(), PeerState::Disconnected);

        let mut outbox = Outbox::default();
        let conn = Connection::direct(ConnectionId(1), Link::Outbound);
        peer.install(&mut outbox, conn, DisconnectReason::Superseded);
        assert_eq!(peer.state(), PeerState::Connecting);

        let identity = Identity::from([5u8; 32]);
        let conn = peer.connection_mut(ConnectionKind::Direct).unwrap();
        conn.set_state(State::WaitingForIdentity);
        conn.set_state(State::Connected { identity });
        assert_eq!(peer.state(), PeerState::Connected { identity });
    }

    #[test]
    fn test_install_closes_displaced() {
        let mut peer = Peer::new(PeerId(1));
        let mut outbox = Outbox::default();

        peer.install(
            &mut outbox,
            Connection::direct(ConnectionId(1), Link::Outbound),
            DisconnectReason::Superseded,
        );
        let displaced = peer
            .install(
                &mut outbox,
                Connection::direct(ConnectionId(2), Link::Inbound),
                DisconnectReason::Superseded,
            )
            .expect("the first connection is displaced");

        assert_eq!(displaced.id, ConnectionId(1));
        assert!(displaced.is_disconnected());
        assert!(outbox
            .queue()
            .iter()
            .any(|io| matches!(io, Io::Disconnect(ConnectionId(1), _))));
        assert_eq!(
            peer.connection(ConnectionKind::Direct).unwrap().id,
            ConnectionId(2)
        );
    }

    #[test]
    fn test_known_peers_idempotent() {
        let mut peer = Peer::new(PeerId(1));
        let other = Identity::from([9u8; 32]);

        assert!(peer.add_known_peer(other));
        assert!(!peer.add_known_peer(other));
        assert!(peer.knows(&other));
        assert!(peer.remove_known_peer(&other));
        assert!(!peer.remove_known_peer(&other));
    }

    #[test]
    fn test_display_name() {
        let mut peer = Peer::new(PeerId(3));
        assert_eq!(peer.display_name(), "peer#3");

        peer.address = Some("seed.weft.network".to_owned());
        peer.port = Some(9040);
        assert_eq!(peer.display_name(), "seed.weft.network:9040");

        let identity = Identity::from([0u8; 32]);
        peer.identity = Some(identity);
        assert_eq!(peer.display_name(), identity.short());

        peer.name = Some("olm".to_owned());
        assert_eq!(peer.display_name(), format!("olm@{}", identity.short()));
    }
}
