//! The peer manager.
//!
//! Owns every peer record and transport connection, runs the identity
//! handshake, relays signalling between brokered peers, and gossips the
//! connected-peer graph. Everything happens on one logical event loop:
//! the runtime feeds transport events in, and drains [`Io`] actions out.
pub mod config;
pub mod connection;
pub mod io;
pub mod local;
pub mod message;
pub mod peer;
pub mod retry;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use fastrand::Rng;
use localtime::{LocalDuration, LocalTime};
use log::*;

use weft::collections::RandomMap;
use weft::crypto::Boxer;
use weft::events::{Emitter, Events};
use weft::identity;
use weft::Identity;

use crate::clock::Timestamp;
use crate::Link;

pub use crate::service::config::Config;
pub use crate::service::connection::{Connection, ConnectionId, ConnectionKind, State};
pub use crate::service::io::{Io, Outbox};
pub use crate::service::local::LocalPeer;
pub use crate::service::message::Message;
pub use crate::service::peer::{DisconnectWindow, Peer, PeerId, PeerState};
pub use crate::service::retry::Retry;

use self::message::{Disconnecting, PeerEntry, PeerList, Signal, SignalRequest, SignalingPayload};

/// How long a congested node asks an unconnected peer to stay away.
pub const CONGESTED_WINDOW: LocalDuration = LocalDuration::from_mins(5);

/// Protocol violations attributable to a connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("incompatible protocol version {theirs}, ours is {ours}")]
    IncompatibleVersion { ours: u32, theirs: u32 },
    #[error("name exceeds {0} characters")]
    NameTooLong(usize),
    #[error("unexpected message type `{0}` during handshake")]
    UnexpectedMessage(u16),
    #[error("identify received on an already identified connection")]
    AlreadyIdentified,
    #[error("malformed signalling payload")]
    MalformedSignal,
}

/// Policy refusals.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("local disconnect window in effect until {0}")]
    DisconnectWindow(Timestamp),
}

/// Session error. Failures at this level close a single connection, never
/// the whole peer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("network: {0}")]
    Network(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Why a connection was closed.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Error with the underlying transport session.
    Connection(Arc<dyn std::error::Error + Sync + Send>),
    /// Session error.
    Session(Error),
    /// Connection lost a duplicate-connection arbitration.
    Conflict,
    /// Connection claimed our own identity.
    SelfConnection,
    /// Connection displaced by a newer one in the same slot.
    Superseded,
    /// The remote asked us to disconnect.
    Peer(message::DisconnectReason),
    /// Local disconnect request.
    Command,
}

impl DisconnectReason {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }

    pub fn connection() -> Self {
        DisconnectReason::Connection(Arc::new(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "{err}"),
            Self::Session(err) => write!(f, "{err}"),
            Self::Conflict => write!(f, "connection conflict"),
            Self::SelfConnection => write!(f, "closing connection from our own identity"),
            Self::Superseded => write!(f, "connection superseded"),
            Self::Peer(reason) => write!(f, "peer requested disconnect: {reason}"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Address string parsing errors.
#[derive(thiserror::Error, Debug)]
pub enum AddressParseError {
    #[error("unsupported address `{0}`")]
    Unsupported(String),
    #[error("invalid port: {0}")]
    Port(#[from] std::num::ParseIntError),
}

/// A service event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer completed its identity handshake.
    PeerConnected { id: PeerId, identity: Identity },
    /// A peer lost its last authenticated connection.
    PeerDisconnected { id: PeerId, reason: String },
    /// Application traffic from an identified peer.
    Message {
        id: PeerId,
        identity: Identity,
        message: Message,
    },
    /// The set of connected peers changed.
    ConnectedPeersChanged,
    /// A peer's neighbour edges changed.
    KnownPeersChanged { id: PeerId },
}

/// Holds all peer records, indexed by handle, identity and connection.
///
/// The flat map owns the records; `identified` is the sole authority for
/// identity routing, and `connections` routes transport events.
#[derive(Debug)]
pub struct Peers {
    peers: RandomMap<PeerId, Peer>,
    identified: RandomMap<Identity, PeerId>,
    connections: RandomMap<ConnectionId, PeerId>,
    peer_seq: u64,
    conn_seq: u64,
}

impl Peers {
    pub fn new(rng: Rng) -> Self {
        Self {
            peers: RandomMap::with_hasher(rng.clone().into()),
            identified: RandomMap::with_hasher(rng.clone().into()),
            connections: RandomMap::with_hasher(rng.into()),
            peer_seq: 0,
            conn_seq: 0,
        }
    }

    /// Allocate a fresh transport session handle.
    pub fn connection_id(&mut self) -> ConnectionId {
        self.conn_seq += 1;
        ConnectionId(self.conn_seq)
    }

    /// Create a fresh, empty peer record.
    pub fn create(&mut self) -> &mut Peer {
        self.peer_seq += 1;
        let id = PeerId(self.peer_seq);

        self.peers.entry(id).or_insert_with(|| Peer::new(id))
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Resolve an identity to its unique record.
    pub fn lookup(&self, identity: &Identity) -> Option<PeerId> {
        self.identified.get(identity).copied()
    }

    /// Resolve a transport session to the record holding it.
    pub fn by_connection(&self, conn: ConnectionId) -> Option<PeerId> {
        self.connections.get(&conn).copied()
    }

    /// Resolve a transport session to its connection object.
    pub fn connection_mut(&mut self, conn: ConnectionId) -> Option<(PeerId, &mut Connection)> {
        let id = self.by_connection(conn)?;
        let peer = self.peers.get_mut(&id)?;

        peer.connections_mut().find(|c| c.id == conn).map(|c| (id, c))
    }

    /// Bind an identity to a record. The identity must be unbound, or
    /// already bound to this record.
    pub fn index_identity(&mut self, id: PeerId, identity: Identity) {
        let previous = self.identified.insert(identity, id);

        assert!(
            previous.is_none() || previous == Some(id),
            "Peers::index_identity: identity {identity} already bound to {:?}",
            previous
        );
    }

    /// Install a connection on a peer, closing and unindexing whatever
    /// previously occupied the slot.
    pub fn attach(
        &mut self,
        outbox: &mut Outbox,
        id: PeerId,
        conn: Connection,
        displaced: DisconnectReason,
    ) {
        let conn_id = conn.id;
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if let Some(previous) = peer.install(outbox, conn, displaced) {
            self.connections.remove(&previous.id);
        }
        self.connections.insert(conn_id, id);
    }

    /// Detach a connection from a peer without closing it.
    pub fn detach(&mut self, id: PeerId, kind: ConnectionKind) -> Option<Connection> {
        let conn = self.peers.get_mut(&id)?.detach(kind)?;
        self.connections.remove(&conn.id);

        Some(conn)
    }

    /// Remove a record from every index.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;

        if let Some(identity) = &peer.identity {
            if self.identified.get(identity) == Some(&id) {
                self.identified.remove(identity);
            }
        }
        for conn in peer.connections() {
            self.connections.remove(&conn.id);
        }
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Peer)> {
        self.peers.iter()
    }

    /// Iterator over the identity index.
    pub fn identified(&self) -> impl Iterator<Item = (&Identity, PeerId)> {
        self.identified.iter().map(|(identity, id)| (identity, *id))
    }

    /// Snapshot of all record handles, for iterate-and-mutate patterns.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids = self.peers.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Iterator over fully connected peers.
    pub fn connected(&self) -> impl Iterator<Item = (&PeerId, &Peer)> {
        self.peers.iter().filter(|(_, p)| p.is_connected())
    }

    /// Number of peers holding at least one transport connection.
    pub fn with_connection_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.connections().next().is_some())
            .count()
    }

    /// Whether the given identity belongs to a fully connected peer.
    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.lookup(identity)
            .and_then(|id| self.get(id))
            .map(|p| p.is_connected())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The peer manager service.
#[derive(Debug)]
pub struct Service<G> {
    /// Service configuration.
    config: Config,
    /// The local node.
    local: LocalPeer<G>,
    /// All known peer records.
    peers: Peers,
    /// Clock. Tells the time.
    clock: LocalTime,
    /// I/O outbox.
    outbox: Outbox,
    /// Source of entropy.
    rng: Rng,
    /// Last time the peer list was broadcast.
    last_broadcast: LocalTime,
    /// Last time the disposal sweep ran.
    last_dispose: LocalTime,
    /// Time when the service was initialized, or `None` if it is stopped.
    started_at: Option<LocalTime>,
    /// Publishes events to subscribers.
    emitter: Emitter<Event>,
}

impl<G: Boxer> Service<G> {
    pub fn new(config: Config, local: LocalPeer<G>, rng: Rng) -> Self {
        let peers = Peers::new(rng.clone());

        Self {
            config,
            local,
            peers,
            clock: LocalTime::default(),
            outbox: Outbox::default(),
            rng,
            last_broadcast: LocalTime::default(),
            last_dispose: LocalTime::default(),
            started_at: None,
            emitter: Emitter::default(),
        }
    }

    /// Get the local identity.
    pub fn identity(&self) -> Identity {
        self.local.identity
    }

    /// Get the local service time.
    pub fn local_time(&self) -> LocalTime {
        self.clock
    }

    /// Whether the service was started, and if so, at what time.
    pub fn started(&self) -> Option<LocalTime> {
        self.started_at
    }

    /// Get configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the peer registry.
    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Get the local peer.
    pub fn local(&self) -> &LocalPeer<G> {
        &self.local
    }

    /// Get I/O outbox.
    pub fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Return the next i/o action to execute.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    pub fn emitter(&self) -> Emitter<Event> {
        self.emitter.clone()
    }

    /// Subscribe to service events.
    pub fn events(&mut self) -> Events<Event> {
        Events::from(self.emitter.subscribe())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Lifecycle
    ////////////////////////////////////////////////////////////////////////////

    /// Initialize the service with the current time and arm the periodic
    /// tasks.
    pub fn initialize(&mut self, time: LocalTime) {
        debug!(target: "service", "Init @{}", time.as_millis());

        self.clock = time;
        self.started_at = Some(time);
        self.last_broadcast = time;
        self.last_dispose = time;
        self.outbox.wakeup(self.config.broadcast_interval);
        self.outbox.wakeup(self.config.dispose_interval);
    }

    /// Update the clock.
    pub fn tick(&mut self, now: LocalTime) {
        if now >= self.clock {
            self.clock = now;
        } else {
            // Nb. In tests, we often move the clock forwards in time to test different
            // behaviors, so this warning isn't applicable there.
            #[cfg(not(test))]
            warn!(
                target: "service",
                "System clock is not monotonic: {now} is not greater or equal to {}", self.clock
            );
        }
    }

    /// Run periodic tasks that are due.
    pub fn wake(&mut self) {
        let now = self.clock;

        if self.started_at.is_none() {
            trace!(target: "service", "Ignoring wakeup on stopped service");
            return;
        }
        if now - self.last_broadcast >= self.config.broadcast_interval {
            trace!(target: "service", "Running 'broadcast' task...");

            self.broadcast_peer_list();
            self.outbox.wakeup(self.config.broadcast_interval);
            self.last_broadcast = now;
        }
        if now - self.last_dispose >= self.config.dispose_interval {
            trace!(target: "service", "Running 'dispose' task...");

            self.dispose_peers();
            self.outbox.wakeup(self.config.dispose_interval);
            self.last_dispose = now;
        }
    }

    /// Stop the service: disconnect every known peer and disarm the
    /// periodic tasks. Idempotent.
    pub fn shutdown(&mut self) {
        if self.started_at.is_none() {
            return;
        }
        info!(target: "service", "Shutting down..");

        let until = Timestamp::from(self.clock);
        for id in self.peers.ids() {
            self.disconnect(id, message::DisconnectReason::ShuttingDown, until);
        }
        self.started_at = None;
    }

    ////////////////////////////////////////////////////////////////////////////
    // Public operations
    ////////////////////////////////////////////////////////////////////////////

    /// Create a peer record for an address and dial it directly.
    pub fn connect_to_address(&mut self, addr: &str) -> Result<PeerId, AddressParseError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::Unsupported(addr.to_owned()))?;
        if host.is_empty() {
            return Err(AddressParseError::Unsupported(addr.to_owned()));
        }
        let port: u16 = port.parse()?;
        let whitelisted = self.config.is_whitelisted(host);

        let peer = self.peers.create();
        let id = peer.id;
        peer.address = Some(host.to_owned());
        peer.port = Some(port);
        peer.whitelisted = whitelisted;

        self.connect_direct(id);

        Ok(id)
    }

    /// Dial a peer's configured address over the direct transport.
    pub fn connect_direct(&mut self, id: PeerId) -> bool {
        if !self.can_dial(id, ConnectionKind::Direct) {
            debug!(target: "service", "Refusing direct dial of peer {id}");
            return false;
        }
        // The dial predicate established these.
        let Some((host, port)) = self
            .peers
            .get(id)
            .and_then(|p| p.address.clone().zip(p.port))
        else {
            return false;
        };
        let conn_id = self.peers.connection_id();
        let conn = Connection::direct(conn_id, Link::Outbound);

        debug!(target: "service", "Dialing {host}:{port} ({conn_id})..");

        self.peers
            .attach(&mut self.outbox, id, conn, DisconnectReason::Superseded);
        self.outbox.dial(conn_id, host, port);

        true
    }

    /// Establish an assisted session to a peer, brokered by a common
    /// neighbour.
    pub fn connect_assisted(&mut self, id: PeerId) -> bool {
        if !self.can_dial(id, ConnectionKind::Assisted) {
            debug!(target: "service", "Refusing assisted dial of peer {id}");
            return false;
        }
        let now = self.clock;
        // The dial predicate established this.
        let Some(target) = self.peers.get(id).and_then(|p| p.identity) else {
            return false;
        };
        let Some(broker) = self.select_broker(id, &target) else {
            debug!(target: "service", "No broker available for {}", target.short());

            if let Some(peer) = self.peers.get_mut(id) {
                let whitelisted = peer.whitelisted;
                peer.retry_mut(ConnectionKind::Assisted, Link::Outbound)
                    .failed(now, whitelisted);
            }
            return false;
        };
        let conn_id = self.peers.connection_id();

        if identity::can_initiate(&self.local.identity, &target) {
            // We open the session and send the first signalling payload.
            let mut conn = Connection::assisted(conn_id, Link::Outbound, true, broker);
            conn.open();
            conn.set_state(State::Signaling);

            debug!(
                target: "service",
                "Initiating assisted session to {} via {} ({conn_id})..",
                target.short(),
                broker.short()
            );
            self.peers
                .attach(&mut self.outbox, id, conn, DisconnectReason::Superseded);
            self.outbox.open(conn_id, true);
        } else {
            // The remote must open the session; ask it to, via the broker.
            let mut conn = Connection::assisted(conn_id, Link::Inbound, false, broker);
            conn.set_state(State::RequestSignaling);

            debug!(
                target: "service",
                "Requesting assisted session from {} via {} ({conn_id})..",
                target.short(),
                broker.short()
            );
            self.peers
                .attach(&mut self.outbox, id, conn, DisconnectReason::Superseded);

            let request = Message::SignalRequest(SignalRequest {
                source: self.local.identity,
                destination: target,
            });
            if broker == target {
                self.send_to(id, request);
            } else if let Some(bid) = self.peers.lookup(&broker) {
                self.send_to(bid, request);
            }
        }
        true
    }

    /// Wrap an accepted inbound direct session into a fresh peer record.
    /// Returns the record and the handle the runtime must bind the
    /// session to.
    pub fn accepted(&mut self, host: Option<String>) -> (PeerId, ConnectionId) {
        let conn_id = self.peers.connection_id();
        let peer = self.peers.create();
        let id = peer.id;

        peer.address = host;

        let mut conn = Connection::direct(conn_id, Link::Inbound);
        // The transport is already up; identify ourselves right away.
        conn.set_state(State::WaitingForIdentity);
        conn.send(&mut self.outbox, Message::Identify(self.local.identify()));

        debug!(
            target: "service",
            "Accepted inbound connection from {} ({conn_id})",
            peer.display_name()
        );
        self.peers
            .attach(&mut self.outbox, id, conn, DisconnectReason::Superseded);

        (id, conn_id)
    }

    /// Set the local-requested-disconnect window, notify the remote on
    /// every connection that can still transmit, and close the peer.
    pub fn disconnect(&mut self, id: PeerId, reason: message::DisconnectReason, until: Timestamp) {
        let local = self.local.identity;
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        debug!(
            target: "service",
            "Disconnecting {} until {until} ({reason})", peer.display_name()
        );
        peer.local_disconnect = Some(DisconnectWindow { reason, until });

        let notice = Message::Disconnecting(Disconnecting {
            source: local,
            destination: peer.identity,
            reason,
            until,
        });
        for conn in peer.connections_mut() {
            conn.send(&mut self.outbox, notice.clone());
        }
        self.close_peer(id, DisconnectReason::Command);
    }

    /// Send a message to a peer. Returns whether a connection admitted it.
    pub fn send_to(&mut self, id: PeerId, msg: Message) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        msg.log(log::Level::Debug, &peer.display_name(), Link::Outbound);

        // Prefer the direct transport when both can transmit.
        for kind in [ConnectionKind::Direct, ConnectionKind::Assisted] {
            if let Some(conn) = peer.connection_mut(kind) {
                if conn.state.can_send() {
                    return conn.send(&mut self.outbox, msg);
                }
            }
        }
        trace!(target: "service", "No connection to {} admits {:?}", peer.display_name(), msg);

        false
    }

    /// Send a message to every connected peer.
    pub fn broadcast(&mut self, msg: Message) {
        let connected = self
            .peers
            .connected()
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in connected {
            self.send_to(id, msg.clone());
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Transport events
    ////////////////////////////////////////////////////////////////////////////

    /// An outbound direct session finished its transport handshake.
    pub fn dialed(&mut self, conn: ConnectionId) {
        self.transport_up(conn);
    }

    /// An assisted session finished signalling and is established.
    pub fn session_established(&mut self, conn: ConnectionId) {
        self.transport_up(conn);
    }

    fn transport_up(&mut self, conn_id: ConnectionId) {
        let identify = Message::Identify(self.local.identify());
        let Some((_, conn)) = self.peers.connection_mut(conn_id) else {
            trace!(target: "service", "Transport event for unknown connection {conn_id}");
            return;
        };
        match conn.state {
            State::Connecting | State::Signaling => {
                conn.set_state(State::WaitingForIdentity);
                conn.send(&mut self.outbox, identify);
            }
            ref state => {
                trace!(
                    target: "service",
                    "Ignoring transport establishment for {conn_id} in state {state}"
                );
            }
        }
    }

    /// A transport session closed.
    pub fn disconnected(&mut self, conn_id: ConnectionId, reason: &DisconnectReason) {
        let Some(peer_id) = self.peers.by_connection(conn_id) else {
            // Since we sometimes disconnect eagerly, it's not unusual to get a second
            // disconnection event once the transport is dropped.
            trace!(target: "service", "Redundant disconnection for {conn_id} ({reason})");
            return;
        };
        let Some(kind) = self.peers.get(peer_id).and_then(|p| p.kind_of(conn_id)) else {
            return;
        };
        let before = match self.peers.get(peer_id) {
            Some(p) => p.state(),
            None => return,
        };
        let Some(mut conn) = self.peers.detach(peer_id, kind) else {
            return;
        };
        let was_connected = conn.is_connected();
        if !conn.is_disconnected() {
            conn.set_state(State::Disconnected);
        }
        if let Some(peer) = self.peers.get(peer_id) {
            info!(
                target: "service",
                "Disconnected from {} ({reason})", peer.display_name()
            );
        }
        self.connection_dropped(peer_id, kind, conn.link, was_connected, before, reason, true);
    }

    /// One wire frame was received on a session.
    pub fn received(&mut self, conn_id: ConnectionId, msg: Message) {
        let Some(peer_id) = self.peers.by_connection(conn_id) else {
            trace!(target: "service", "Message on unknown connection {conn_id}");
            return;
        };
        if let Err(err) = self.handle_message(peer_id, conn_id, msg) {
            // If there's an error, stop processing messages from this connection.
            if let Some(peer) = self.peers.get(peer_id) {
                debug!(
                    target: "service",
                    "Session error for {}: {err}", peer.display_name()
                );
            }
            self.close_connection(peer_id, conn_id, DisconnectReason::Session(err));
        }
    }

    /// The assisted transport produced a local signalling payload; seal
    /// it and route it through the connection's broker.
    pub fn signal_emitted(&mut self, conn_id: ConnectionId, payload: SignalingPayload) {
        let Some(peer_id) = self.peers.by_connection(conn_id) else {
            trace!(target: "service", "Signal from unknown connection {conn_id}");
            return;
        };
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let Some(target) = peer.identity else {
            debug!(target: "service", "Dropping signal from unidentified peer {peer_id}");
            return;
        };
        let Some(broker) = peer
            .connection(ConnectionKind::Assisted)
            .filter(|c| c.id == conn_id)
            .and_then(|c| c.broker)
        else {
            debug!(target: "service", "Dropping signal from non-assisted connection {conn_id}");
            return;
        };
        let plaintext = match serde_json::to_vec(&payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                error!(target: "service", "Error encoding signalling payload: {e}");
                return;
            }
        };
        let sealed = self.local.seal(&plaintext, &target);
        let msg = Message::Signal(Signal {
            source: self.local.identity,
            destination: target,
            nonce: sealed.nonce,
            signal: sealed.ciphertext,
        });

        if broker == target {
            // We hold a session to the target ourselves; no relay needed.
            self.send_to(peer_id, msg);
        } else if let Some(bid) = self.peers.lookup(&broker).filter(|bid| {
            self.peers
                .get(*bid)
                .map(|b| b.is_connected())
                .unwrap_or(false)
        }) {
            self.send_to(bid, msg);
        } else {
            debug!(target: "service", "Signalling broker {} unavailable", broker.short());
            self.close_connection(
                peer_id,
                conn_id,
                DisconnectReason::Session(Error::Network(
                    "signalling broker unavailable".to_owned(),
                )),
            );
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Message dispatch
    ////////////////////////////////////////////////////////////////////////////

    pub fn handle_message(
        &mut self,
        peer_id: PeerId,
        conn_id: ConnectionId,
        msg: Message,
    ) -> Result<(), Error> {
        let Some(peer) = self.peers.get(peer_id) else {
            return Ok(());
        };
        let Some(state) = peer
            .connections()
            .find(|c| c.id == conn_id)
            .map(|c| c.state.clone())
        else {
            debug!(target: "service", "Message on stale connection {conn_id}");
            return Ok(());
        };
        msg.log(log::Level::Debug, &peer.display_name(), Link::Inbound);

        // Disconnection notices are honored in every state, relayed or not.
        if let Message::Disconnecting(notice) = msg {
            return self.handle_disconnecting(peer_id, notice);
        }
        match state {
            State::Disconnected => {
                debug!(target: "service", "Ignoring message on closed connection {conn_id}");
                Ok(())
            }
            // The first message on a fresh connection must identify the remote.
            State::WaitingForIdentity => match msg {
                Message::Identify(identify) => self.handle_identify(peer_id, conn_id, identify),
                other => Err(ProtocolError::UnexpectedMessage(other.type_id()).into()),
            },
            State::Connecting | State::RequestSignaling | State::Signaling => {
                debug!(
                    target: "service",
                    "Ignoring {:?} on connection {conn_id} in state {state}", msg
                );
                Ok(())
            }
            State::Connected { identity } => match msg {
                Message::Identify(_) => {
                    debug!(target: "service", "Redundant identify on {conn_id}");
                    Err(ProtocolError::AlreadyIdentified.into())
                }
                Message::SignalRequest(request) => {
                    self.handle_signal_request(peer_id, conn_id, request)
                }
                Message::Signal(signal) => self.handle_signal(peer_id, conn_id, signal),
                Message::PeerList(list) => self.handle_peer_list(peer_id, list),
                Message::Disconnecting(_) => unreachable!("handled above"),
                msg @ Message::Application { .. } => {
                    self.emitter.emit(Event::Message {
                        id: peer_id,
                        identity,
                        message: msg,
                    });
                    Ok(())
                }
            },
        }
    }

    /// Handle the first message on a fresh connection.
    fn handle_identify(
        &mut self,
        peer_id: PeerId,
        conn_id: ConnectionId,
        msg: message::Identify,
    ) -> Result<(), Error> {
        let now = self.clock;
        let local = self.local.identity;

        // The identity format itself is enforced by the wire decoder,
        // which only yields fixed-width identities.

        if !self.local.version.is_compatible(&msg.version) {
            return Err(ProtocolError::IncompatibleVersion {
                ours: self.local.version.protocol,
                theirs: msg.version.protocol,
            }
            .into());
        }
        if let Some(name) = &msg.name {
            if name.chars().count() > self.config.name_max_len {
                return Err(ProtocolError::NameTooLong(self.config.name_max_len).into());
            }
        }
        // A connection claiming our own identity is dialing ourselves.
        if msg.identity == local {
            debug!(target: "service", "Rejecting connection from our own identity");

            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.address = None;
                peer.port = None;
                peer.retry_mut(ConnectionKind::Direct, Link::Outbound)
                    .never_retry();
            }
            self.close_connection(peer_id, conn_id, DisconnectReason::SelfConnection);

            return Ok(());
        }

        // Find the canonical record for this identity, migrating the
        // connection if this record isn't it.
        let (target_id, migrated) = self.canonical_record(peer_id, conn_id, &msg);

        let mut aborted = false;
        if let Some(conn) = migrated {
            aborted = !self.arbitrate_and_install(target_id, conn, &msg.identity);
        }
        if target_id != peer_id {
            self.try_dispose(peer_id);
        }
        if aborted {
            return Ok(());
        }

        let before = match self.peers.get(target_id) {
            Some(p) => p.state(),
            None => return Ok(()),
        };
        let Some(peer) = self.peers.get_mut(target_id) else {
            return Ok(());
        };
        let Some(kind) = peer.kind_of(conn_id) else {
            return Ok(());
        };
        let Some(link) = peer.connection(kind).map(|c| c.link) else {
            return Ok(());
        };
        // Inbound acceptors don't know the remote's listening port; adopt
        // the advertised one.
        if kind == ConnectionKind::Direct && link == Link::Inbound {
            peer.port = msg.port;
        }
        peer.name = msg.name.clone();
        peer.version = Some(msg.version.clone());
        peer.is_worker = msg.is_worker;

        // If we asked this remote to stay away and the window is still
        // open, remind it and refuse the handshake.
        if let Some(window) = peer.local_disconnect {
            if Timestamp::from(now) < window.until {
                let notice = Message::Disconnecting(Disconnecting {
                    source: local,
                    destination: Some(msg.identity),
                    reason: window.reason,
                    until: window.until,
                });
                if let Some(conn) = peer.connection_mut(kind) {
                    conn.send(&mut self.outbox, notice);
                }
                debug!(
                    target: "service",
                    "Refusing handshake from {}: disconnect window open until {}",
                    msg.identity.short(),
                    window.until
                );
                self.close_connection(
                    target_id,
                    conn_id,
                    DisconnectReason::Session(PolicyError::DisconnectWindow(window.until).into()),
                );
                return Ok(());
            }
        }
        peer.identity = Some(msg.identity);
        peer.retry_mut(kind, link).succeeded();

        if let Some(conn) = peer.connection_mut(kind) {
            conn.set_state(State::Connected {
                identity: msg.identity,
            });
        }
        info!(target: "service", "Connected to {} ({kind}, {link})", peer.display_name());

        self.peers.index_identity(target_id, msg.identity);
        self.emitter.emit(Event::PeerConnected {
            id: target_id,
            identity: msg.identity,
        });
        if !matches!(before, PeerState::Connected { .. }) {
            self.emitter.emit(Event::ConnectedPeersChanged);
        }
        Ok(())
    }

    /// Resolve the record a handshaking connection belongs on. Detaches
    /// and returns the connection if it must migrate.
    fn canonical_record(
        &mut self,
        peer_id: PeerId,
        conn_id: ConnectionId,
        msg: &message::Identify,
    ) -> (PeerId, Option<Connection>) {
        let Some(peer) = self.peers.get(peer_id) else {
            return (peer_id, None);
        };
        let prior = peer.identity;
        let Some(kind) = peer.kind_of(conn_id) else {
            return (peer_id, None);
        };

        if let Some(prior) = prior {
            if prior != msg.identity {
                // The remote claimed a different identity than this record
                // holds: move the connection to the real identity's record.
                debug!(
                    target: "service",
                    "Peer {} identified as {}, expected {}",
                    peer_id,
                    msg.identity.short(),
                    prior.short()
                );
                let Some(conn) = self.peers.detach(peer_id, kind) else {
                    return (peer_id, None);
                };
                let Some(old) = self.peers.get_mut(peer_id) else {
                    return (peer_id, None);
                };
                old.retry_mut(conn.kind, conn.link).never_retry();

                let (address, port) =
                    if conn.kind == ConnectionKind::Direct && conn.link == Link::Outbound {
                        (old.address.take(), old.port.take())
                    } else {
                        (None, None)
                    };
                let target_id = self.lookup_or_create(msg.identity);
                if let Some(target) = self.peers.get_mut(target_id) {
                    if address.is_some() {
                        target.address = address;
                        target.port = port;
                    }
                }
                return (target_id, Some(conn));
            }
        }
        if let Some(incumbent) = self.peers.lookup(&msg.identity) {
            if incumbent != peer_id {
                // Another record already owns this identity: keep the
                // incumbent, move the connection onto it, and retire this
                // record. Outside holders of the incumbent stay valid.
                debug!(
                    target: "service",
                    "Merging {} into existing record for {}",
                    peer_id,
                    msg.identity.short()
                );
                let Some(conn) = self.peers.detach(peer_id, kind) else {
                    return (peer_id, None);
                };
                if let Some(old) = self.peers.get_mut(peer_id) {
                    old.retry_mut(ConnectionKind::Direct, Link::Outbound)
                        .never_retry();
                    old.retry_mut(ConnectionKind::Assisted, Link::Outbound)
                        .never_retry();
                }
                return (incumbent, Some(conn));
            }
        }
        (peer_id, None)
    }

    /// Install a migrating connection on its canonical record, arbitrating
    /// against any connected incumbent of the same transport class.
    /// Returns `false` if the new connection lost and the handshake must
    /// be aborted.
    fn arbitrate_and_install(
        &mut self,
        target_id: PeerId,
        mut conn: Connection,
        remote: &Identity,
    ) -> bool {
        let incumbent = self
            .peers
            .get(target_id)
            .and_then(|p| p.connection(conn.kind))
            .filter(|c| c.is_connected())
            .map(|c| (c.id, c.link));

        if let Some((incumbent_id, incumbent_link)) = incumbent {
            // Exactly one side of the pair is the designated initiator;
            // the surviving duplicate is the one it opened. On ties, the
            // incumbent wins.
            let winner = if identity::can_initiate(&self.local.identity, remote) {
                Link::Outbound
            } else {
                Link::Inbound
            };
            if incumbent_link == winner || incumbent_link == conn.link {
                debug!(
                    target: "service",
                    "Closing duplicate {} connection to {} ({} loses to incumbent)",
                    conn.kind,
                    remote.short(),
                    conn.id,
                );
                conn.close(&mut self.outbox, DisconnectReason::Conflict);
                return false;
            }
            debug!(
                target: "service",
                "Closing duplicate {} connection to {} ({incumbent_id} loses to {})",
                conn.kind,
                remote.short(),
                conn.id,
            );
            if let Some(mut incumbent) = self.peers.detach(target_id, conn.kind) {
                incumbent.close(&mut self.outbox, DisconnectReason::Conflict);
            }
        }
        self.peers.attach(
            &mut self.outbox,
            target_id,
            conn,
            DisconnectReason::Superseded,
        );
        true
    }

    /// Handle a disconnection notice.
    fn handle_disconnecting(&mut self, peer_id: PeerId, notice: Disconnecting) -> Result<(), Error> {
        if let Some(destination) = notice.destination {
            if destination != self.local.identity {
                return self.relay(peer_id, destination, Message::Disconnecting(notice));
            }
        }
        // Addressed to us. The notice applies to the record of its source,
        // which isn't necessarily the sending connection when brokered.
        let target_id = match self.peers.get(peer_id) {
            Some(sender) if sender.identity == Some(notice.source) => peer_id,
            _ => match self.peers.lookup(&notice.source) {
                Some(id) => id,
                None => {
                    debug!(
                        target: "service",
                        "Dropping disconnect notice from unknown source {}",
                        notice.source.short()
                    );
                    return Ok(());
                }
            },
        };
        let Some(peer) = self.peers.get_mut(target_id) else {
            return Ok(());
        };
        debug!(
            target: "service",
            "{} requested disconnect until {} ({})",
            peer.display_name(),
            notice.until,
            notice.reason
        );
        peer.peer_disconnect = Some(DisconnectWindow {
            reason: notice.reason,
            until: notice.until,
        });
        self.close_peer(target_id, DisconnectReason::Peer(notice.reason));

        Ok(())
    }

    /// Handle a request to initiate an assisted session.
    fn handle_signal_request(
        &mut self,
        peer_id: PeerId,
        conn_id: ConnectionId,
        request: SignalRequest,
    ) -> Result<(), Error> {
        if request.destination != self.local.identity {
            return self.relay(peer_id, request.destination, Message::SignalRequest(request));
        }
        // The source is the designated initiator for this pair; it should
        // have opened the session itself instead of asking us to.
        if identity::can_initiate(&request.source, &request.destination) {
            debug!(
                target: "service",
                "Dropping signal request from designated initiator {}",
                request.source.short()
            );
            return Ok(());
        }
        if self.reject_congested(conn_id, &request.source) {
            return Ok(());
        }
        let Some(broker) = self.peers.get(peer_id).and_then(|p| p.identity) else {
            debug!(target: "service", "Dropping signal request relayed by unidentified peer");
            return Ok(());
        };
        let target_id = self.lookup_or_create(request.source);

        // The relaying peer evidently knows the target; record the edge.
        // When the request came in directly, there is no edge to record.
        if broker != request.source {
            if let Some(target) = self.peers.get_mut(target_id) {
                if target.add_known_peer(broker) {
                    self.emitter.emit(Event::KnownPeersChanged { id: target_id });
                }
            }
            if let Some(sender) = self.peers.get_mut(peer_id) {
                if sender.add_known_peer(request.source) {
                    self.emitter.emit(Event::KnownPeersChanged { id: peer_id });
                }
            }
        }

        let has_assisted = self
            .peers
            .get(target_id)
            .map(|p| p.connection(ConnectionKind::Assisted).is_some())
            .unwrap_or(true);
        if !has_assisted {
            let assisted_id = self.peers.connection_id();
            let mut conn = Connection::assisted(assisted_id, Link::Outbound, true, broker);
            conn.open();
            conn.set_state(State::Signaling);

            debug!(
                target: "service",
                "Initiating assisted session to {} via {} ({assisted_id})..",
                request.source.short(),
                broker.short()
            );
            self.peers.attach(
                &mut self.outbox,
                target_id,
                conn,
                DisconnectReason::Superseded,
            );
            self.outbox.open(assisted_id, true);
        }
        Ok(())
    }

    /// Handle a sealed signalling payload.
    fn handle_signal(
        &mut self,
        peer_id: PeerId,
        conn_id: ConnectionId,
        signal: Signal,
    ) -> Result<(), Error> {
        if signal.destination != self.local.identity {
            return self.relay(peer_id, signal.destination, Message::Signal(signal));
        }
        if self.reject_congested(conn_id, &signal.source) {
            return Ok(());
        }
        let Some(broker) = self.peers.get(peer_id).and_then(|p| p.identity) else {
            debug!(target: "service", "Dropping signal relayed by unidentified peer");
            return Ok(());
        };
        let source_id = self.lookup_or_create(signal.source);

        // Make sure an assisted connection exists for the source. If we
        // didn't create one, the remote initiated: we are the non-initiator.
        let has_assisted = self
            .peers
            .get(source_id)
            .map(|p| p.connection(ConnectionKind::Assisted).is_some())
            .unwrap_or(true);
        if !has_assisted {
            let assisted_id = self.peers.connection_id();
            let conn = Connection::assisted(assisted_id, Link::Inbound, false, broker);

            self.peers.attach(
                &mut self.outbox,
                source_id,
                conn,
                DisconnectReason::Superseded,
            );
        }
        let Some(peer) = self.peers.get_mut(source_id) else {
            return Ok(());
        };
        let Some(conn) = peer.connection_mut(ConnectionKind::Assisted) else {
            return Ok(());
        };
        let assisted_id = conn.id;

        // Signalling has started; create the session on our side if it
        // doesn't exist yet.
        match conn.state {
            State::Connecting | State::RequestSignaling => conn.set_state(State::Signaling),
            _ => {}
        }
        if !conn.is_open() {
            let initiator = conn.initiator;
            conn.open();
            self.outbox.open(assisted_id, initiator);
        }

        let Some(plaintext) = self
            .local
            .unseal(&signal.signal, &signal.nonce, &signal.source)
        else {
            debug!(
                target: "service",
                "Failed to decrypt signalling payload from {}",
                signal.source.short()
            );
            self.close_connection(
                source_id,
                assisted_id,
                DisconnectReason::Session(Error::Network(
                    "unable to decrypt signalling payload".to_owned(),
                )),
            );
            return Ok(());
        };
        let payload: SignalingPayload = match serde_json::from_slice(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(
                    target: "service",
                    "Malformed signalling payload from {}: {e}",
                    signal.source.short()
                );
                self.close_connection(
                    source_id,
                    assisted_id,
                    DisconnectReason::Session(ProtocolError::MalformedSignal.into()),
                );
                return Ok(());
            }
        };
        self.outbox.signal_inlet(assisted_id, payload);

        Ok(())
    }

    /// Merge a peer-list gossip message into the known-peer graph.
    fn handle_peer_list(&mut self, peer_id: PeerId, list: PeerList) -> Result<(), Error> {
        let Some(sender) = self.peers.get(peer_id) else {
            return Ok(());
        };
        let Some(sender_identity) = sender.identity.filter(|_| sender.is_connected()) else {
            debug!(target: "service", "Ignoring peer list from unconnected peer {peer_id}");
            return Ok(());
        };
        // Workers don't participate in gossip.
        if self.config.is_worker {
            return Ok(());
        }
        let local = self.local.identity;
        let advertised: BTreeSet<Identity> = list
            .connected_peers
            .iter()
            .map(|e| e.identity)
            .filter(|identity| *identity != local)
            .collect();
        let previous: BTreeSet<Identity> = sender.known_peers().copied().collect();
        let mut changed = false;

        for removed in previous.difference(&advertised) {
            if let Some(sender) = self.peers.get_mut(peer_id) {
                changed |= sender.remove_known_peer(removed);
            }
            if let Some(other_id) = self.peers.lookup(removed) {
                if let Some(other) = self.peers.get_mut(other_id) {
                    other.remove_known_peer(&sender_identity);
                }
                self.try_dispose(other_id);
            }
        }
        for entry in &list.connected_peers {
            if entry.identity == local || previous.contains(&entry.identity) {
                continue;
            }
            let neighbour_id = self.lookup_or_create(entry.identity);
            if let Some(neighbour) = self.peers.get_mut(neighbour_id) {
                if entry.address.is_some() {
                    neighbour.address = entry.address.clone();
                }
                if entry.port.is_some() {
                    neighbour.port = entry.port;
                }
                if entry.name.is_some() {
                    neighbour.name = entry.name.clone();
                }
                neighbour.add_known_peer(sender_identity);
            }
            if let Some(sender) = self.peers.get_mut(peer_id) {
                changed |= sender.add_known_peer(entry.identity);
            }
        }
        self.try_dispose(peer_id);

        if changed {
            self.emitter.emit(Event::KnownPeersChanged { id: peer_id });
        }
        Ok(())
    }

    /// Forward a message not addressed to us. The claimed origin must be
    /// the sending peer, and the destination must be known; single-hop.
    fn relay(&mut self, sender_id: PeerId, destination: Identity, msg: Message) -> Result<(), Error> {
        let Some(sender) = self.peers.get(sender_id) else {
            return Ok(());
        };
        if msg.source() != sender.identity.as_ref() {
            debug!(
                target: "service",
                "Dropping relayed {:?} from {}: spoofed source", msg, sender.display_name()
            );
            return Ok(());
        }
        let Some(dest_id) = self.peers.lookup(&destination) else {
            debug!(
                target: "service",
                "Dropping relayed {:?}: unknown destination {}", msg, destination.short()
            );
            return Ok(());
        };
        self.send_to(dest_id, msg);

        Ok(())
    }

    /// When at peer capacity, decline signalling for unconnected sources,
    /// telling them to stay away for a while. Returns whether the message
    /// was rejected.
    fn reject_congested(&mut self, conn_id: ConnectionId, source: &Identity) -> bool {
        let count = self.peers.with_connection_count();

        if count < self.config.max_peers || self.peers.is_connected(source) {
            return false;
        }
        debug!(
            target: "service",
            "Congested ({count} peers): rejecting signalling from {}", source.short()
        );
        let reply = Message::Disconnecting(Disconnecting {
            source: self.local.identity,
            destination: Some(*source),
            reason: message::DisconnectReason::Congested,
            until: Timestamp::from(self.clock + CONGESTED_WINDOW),
        });
        if let Some((_, conn)) = self.peers.connection_mut(conn_id) {
            conn.send(&mut self.outbox, reply);
        }
        true
    }

    ////////////////////////////////////////////////////////////////////////////
    // Periodic tasks
    ////////////////////////////////////////////////////////////////////////////

    /// Gossip the connected-peer list to every connected peer.
    fn broadcast_peer_list(&mut self) {
        let entries = self
            .peers
            .connected()
            .filter(|(_, p)| self.config.broadcast_workers || !p.is_worker)
            .filter_map(|(id, p)| {
                p.identity.map(|identity| {
                    (
                        *id,
                        PeerEntry {
                            identity,
                            name: p.name.clone(),
                            address: p.address.clone(),
                            port: p.port,
                        },
                    )
                })
            })
            .collect::<Vec<_>>();
        let recipients = self
            .peers
            .connected()
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for recipient in recipients {
            let connected_peers = entries
                .iter()
                .filter(|(id, _)| *id != recipient)
                .map(|(_, entry)| entry.clone())
                .collect::<Vec<_>>();

            self.send_to(
                recipient,
                Message::PeerList(PeerList { connected_peers }),
            );
        }
    }

    /// Dispose every record that qualifies.
    fn dispose_peers(&mut self) {
        for id in self.peers.ids() {
            self.try_dispose(id);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Internals
    ////////////////////////////////////////////////////////////////////////////

    /// The dial-admission predicate.
    fn can_dial(&self, id: PeerId, kind: ConnectionKind) -> bool {
        let Some(peer) = self.peers.get(id) else {
            return false;
        };
        let now = Timestamp::from(self.clock);

        // Upgrading a peer we already have a connection to is always
        // allowed; new peers only below the target.
        if self.peers.with_connection_count() >= self.config.target_peers
            && peer.is_disconnected()
        {
            return false;
        }
        if let Some(window) = &peer.peer_disconnect {
            if window.until > now {
                return false;
            }
        }
        if peer.connection(kind).is_some() {
            return false;
        }
        if !peer.retry(kind, Link::Outbound).can_connect(self.clock) {
            return false;
        }
        match kind {
            ConnectionKind::Direct => peer.address.is_some() && peer.port.is_some(),
            ConnectionKind::Assisted => peer.identity.is_some(),
        }
    }

    /// Pick a broker for an assisted dial: ourselves if we already hold a
    /// session to the target, otherwise a random common neighbour.
    fn select_broker(&mut self, target_id: PeerId, target: &Identity) -> Option<Identity> {
        let peer = self.peers.get(target_id)?;

        if peer.is_connected() {
            // Re-signalling: we can relay to the target directly.
            return Some(*target);
        }
        let mut candidates = peer
            .known_peers()
            .filter(|candidate| {
                self.peers
                    .lookup(candidate)
                    .and_then(|id| self.peers.get(id))
                    .map(|c| c.is_connected() && c.knows(target))
                    .unwrap_or(false)
            })
            .copied()
            .collect::<Vec<_>>();
        candidates.sort();

        if candidates.is_empty() {
            None
        } else {
            Some(candidates[self.rng.usize(..candidates.len())])
        }
    }

    /// Resolve an identity to its record, creating one if unknown.
    fn lookup_or_create(&mut self, identity: Identity) -> PeerId {
        debug_assert!(identity != self.local.identity);

        if let Some(id) = self.peers.lookup(&identity) {
            return id;
        }
        let peer = self.peers.create();
        let id = peer.id;
        peer.identity = Some(identity);
        self.peers.index_identity(id, identity);

        id
    }

    /// Close one connection of a peer, with retry and event bookkeeping.
    fn close_connection(&mut self, peer_id: PeerId, conn_id: ConnectionId, reason: DisconnectReason) {
        let Some(kind) = self.peers.get(peer_id).and_then(|p| p.kind_of(conn_id)) else {
            return;
        };
        let before = match self.peers.get(peer_id) {
            Some(p) => p.state(),
            None => return,
        };
        let Some(mut conn) = self.peers.detach(peer_id, kind) else {
            return;
        };
        let was_connected = conn.is_connected();
        conn.close(&mut self.outbox, reason.clone());

        self.connection_dropped(
            peer_id,
            kind,
            conn.link,
            was_connected,
            before,
            &reason,
            !reason.is_conflict(),
        );
    }

    /// Common accounting after a connection leaves its slot, whether we
    /// closed it or the transport did.
    fn connection_dropped(
        &mut self,
        peer_id: PeerId,
        kind: ConnectionKind,
        link: Link,
        was_connected: bool,
        before: PeerState,
        reason: &DisconnectReason,
        count_failure: bool,
    ) {
        let now = self.clock;

        if let Some(peer) = self.peers.get_mut(peer_id) {
            // A connection that never authenticated counts as a failed
            // attempt, except when it merely lost an arbitration.
            if !was_connected && count_failure {
                let whitelisted = peer.whitelisted;
                peer.retry_mut(kind, link).failed(now, whitelisted);
            }
            let after = peer.state();
            if matches!(before, PeerState::Connected { .. })
                && !matches!(after, PeerState::Connected { .. })
            {
                self.emitter.emit(Event::PeerDisconnected {
                    id: peer_id,
                    reason: reason.to_string(),
                });
                self.emitter.emit(Event::ConnectedPeersChanged);
            }
        }
        self.try_dispose(peer_id);
    }

    /// Close every connection of a peer.
    fn close_peer(&mut self, peer_id: PeerId, reason: DisconnectReason) {
        let before = match self.peers.get(peer_id) {
            Some(p) => p.state(),
            None => return,
        };
        for kind in [ConnectionKind::Direct, ConnectionKind::Assisted] {
            if let Some(mut conn) = self.peers.detach(peer_id, kind) {
                conn.close(&mut self.outbox, reason.clone());
            }
        }
        if matches!(before, PeerState::Connected { .. }) {
            self.emitter.emit(Event::PeerDisconnected {
                id: peer_id,
                reason: reason.to_string(),
            });
            self.emitter.emit(Event::ConnectedPeersChanged);
        }
        self.try_dispose(peer_id);
    }

    /// Dispose a record if it is disconnected, has no connected neighbour,
    /// and will never be re-dialed.
    fn try_dispose(&mut self, peer_id: PeerId) -> bool {
        let Some(peer) = self.peers.get(peer_id) else {
            return false;
        };
        if !peer.is_disconnected() {
            return false;
        }
        if peer
            .known_peers()
            .any(|neighbour| self.peers.is_connected(neighbour))
        {
            return false;
        }
        if !peer
            .retry(ConnectionKind::Direct, Link::Outbound)
            .is_never_retry()
        {
            return false;
        }
        self.dispose(peer_id);

        true
    }

    /// Remove a record from every registry and sever its neighbour edges.
    fn dispose(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        debug!(target: "service", "Disposing {}", peer.display_name());

        if let Some(identity) = peer.identity {
            for neighbour in peer.known_peers() {
                if let Some(other_id) = self.peers.lookup(neighbour) {
                    if let Some(other) = self.peers.get_mut(other_id) {
                        other.remove_known_peer(&identity);
                    }
                }
            }
        }
    }
}
