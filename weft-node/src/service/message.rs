//! Overlay-control messages.
//!
//! These are the only messages the overlay itself understands. Everything
//! else on the wire is application traffic and is surfaced unparsed.
use std::{fmt, io, mem};

use serde::{Deserialize, Serialize};

use weft::crypto::Nonce;
use weft::{Identity, Version};

use crate::clock::Timestamp;
use crate::wire;
use crate::wire::{Decode, Encode};
use crate::Link;

/// Message type.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Identify = 0,
    PeerList = 2,
    SignalRequest = 4,
    Signal = 6,
    Disconnecting = 8,
}

impl From<MessageType> for u16 {
    fn from(other: MessageType) -> Self {
        other as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(other: u16) -> Result<Self, Self::Error> {
        match other {
            0 => Ok(MessageType::Identify),
            2 => Ok(MessageType::PeerList),
            4 => Ok(MessageType::SignalRequest),
            6 => Ok(MessageType::Signal),
            8 => Ok(MessageType::Disconnecting),
            _ => Err(other),
        }
    }
}

/// First message sent on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identify {
    /// The sender's identity.
    pub identity: Identity,
    /// The sender's version.
    pub version: Version,
    /// The port the sender accepts direct connections on, if any.
    pub port: Option<u16>,
    /// Non-unique display name.
    pub name: Option<String>,
    /// Whether the sender is a worker node.
    pub is_worker: bool,
}

/// One entry of a [`PeerList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub identity: Identity,
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// Gossip of the sender's connected peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerList {
    pub connected_peers: Vec<PeerEntry>,
}

/// Ask the destination to initiate an assisted session towards the source.
///
/// Sent by the non-initiator of a pair, relayed by a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRequest {
    pub source: Identity,
    pub destination: Identity,
}

/// A sealed signalling payload, relayed by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub source: Identity,
    pub destination: Identity,
    /// Nonce the payload was sealed under.
    pub nonce: Nonce,
    /// Sealed, JSON-encoded [`SignalingPayload`].
    pub signal: Vec<u8>,
}

/// Reason codes carried by [`Disconnecting`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ShuttingDown = 0,
    Congested = 1,
    BadHandshake = 2,
    Unknown = 3,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = u8;

    fn try_from(other: u8) -> Result<Self, Self::Error> {
        match other {
            0 => Ok(Self::ShuttingDown),
            1 => Ok(Self::Congested),
            2 => Ok(Self::BadHandshake),
            3 => Ok(Self::Unknown),
            _ => Err(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Congested => write!(f, "congested"),
            Self::BadHandshake => write!(f, "bad handshake"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Notice that the source is closing its connection to the destination,
/// and does not want to be re-dialed before `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnecting {
    pub source: Identity,
    /// `None` addresses whoever receives the notice.
    pub destination: Option<Identity>,
    pub reason: DisconnectReason,
    /// Absolute time (ms since epoch) below which re-dialing is refused.
    pub until: Timestamp,
}

/// Native signalling structure of the assisted transport. Exchanged
/// JSON-encoded and sealed inside [`Signal`] messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingPayload {
    /// Session description offered by the initiator.
    Offer { description: String },
    /// Session description answered by the non-initiator.
    Answer { description: String },
    /// A transport route candidate, sent by either side.
    Candidate { candidate: String },
}

/// Message payload.
/// These are the messages peers send to each other.
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// Identity handshake.
    Identify(Identify),
    /// Connected-peer gossip.
    PeerList(PeerList),
    /// Request for assisted-session initiation.
    SignalRequest(SignalRequest),
    /// Sealed signalling payload.
    Signal(Signal),
    /// Disconnection notice.
    Disconnecting(Disconnecting),
    /// Application traffic, opaque to the overlay. The type tag must not
    /// collide with [`MessageType`].
    Application { kind: u16, data: Vec<u8> },
}

impl Message {
    /// The maximum supported message size in bytes.
    pub const MAX_SIZE: wire::Size = wire::Size::MAX - (mem::size_of::<u16>() as wire::Size);

    pub fn type_id(&self) -> u16 {
        match self {
            Self::Identify { .. } => MessageType::Identify.into(),
            Self::PeerList { .. } => MessageType::PeerList.into(),
            Self::SignalRequest { .. } => MessageType::SignalRequest.into(),
            Self::Signal { .. } => MessageType::Signal.into(),
            Self::Disconnecting { .. } => MessageType::Disconnecting.into(),
            Self::Application { kind, .. } => *kind,
        }
    }

    /// The origin claimed by a relayable message, if it is one.
    pub fn source(&self) -> Option<&Identity> {
        match self {
            Self::SignalRequest(SignalRequest { source, .. }) => Some(source),
            Self::Signal(Signal { source, .. }) => Some(source),
            Self::Disconnecting(Disconnecting { source, .. }) => Some(source),
            _ => None,
        }
    }

    pub fn log(&self, level: log::Level, remote: &impl fmt::Display, link: Link) {
        let (verb, prep) = match link {
            Link::Inbound => ("Received", "from"),
            Link::Outbound => ("Sending", "to"),
        };
        log::log!(target: "wire", level, "{verb} {self:?} {prep} {remote}");
    }
}

impl From<Identify> for Message {
    fn from(msg: Identify) -> Self {
        Self::Identify(msg)
    }
}

impl From<PeerList> for Message {
    fn from(msg: PeerList) -> Self {
        Self::PeerList(msg)
    }
}

impl From<SignalRequest> for Message {
    fn from(msg: SignalRequest) -> Self {
        Self::SignalRequest(msg)
    }
}

impl From<Signal> for Message {
    fn from(msg: Signal) -> Self {
        Self::Signal(msg)
    }
}

impl From<Disconnecting> for Message {
    fn from(msg: Disconnecting) -> Self {
        Self::Disconnecting(msg)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identify(Identify {
                identity, version, ..
            }) => {
                write!(f, "Identify({identity}, {version})")
            }
            Self::PeerList(PeerList { connected_peers }) => {
                write!(
                    f,
                    "PeerList([{}])",
                    connected_peers
                        .iter()
                        .map(|e| e.identity.short())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
            Self::SignalRequest(SignalRequest {
                source,
                destination,
            }) => {
                write!(
                    f,
                    "SignalRequest({} -> {})",
                    source.short(),
                    destination.short()
                )
            }
            Self::Signal(Signal {
                source,
                destination,
                signal,
                ..
            }) => {
                write!(
                    f,
                    "Signal({} -> {}, {} bytes)",
                    source.short(),
                    destination.short(),
                    signal.len()
                )
            }
            Self::Disconnecting(Disconnecting { reason, until, .. }) => {
                write!(f, "Disconnecting({reason}, {until})")
            }
            Self::Application { kind, data } => {
                write!(f, "Application({kind:#x}, {} bytes)", data.len())
            }
        }
    }
}

impl Encode for PeerEntry {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.identity.encode(writer)?;
        n += self.name.encode(writer)?;
        n += self.address.encode(writer)?;
        n += self.port.encode(writer)?;

        Ok(n)
    }
}

impl Decode for PeerEntry {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let identity = Identity::decode(reader)?;
        let name = Option::<String>::decode(reader)?;
        let address = Option::<String>::decode(reader)?;
        let port = Option::<u16>::decode(reader)?;

        Ok(Self {
            identity,
            name,
            address,
            port,
        })
    }
}

impl Encode for Message {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.type_id().encode(writer)?;

        match self {
            Self::Identify(Identify {
                identity,
                version,
                port,
                name,
                is_worker,
            }) => {
                n += identity.encode(writer)?;
                n += version.encode(writer)?;
                n += port.encode(writer)?;
                n += name.encode(writer)?;
                n += is_worker.encode(writer)?;
            }
            Self::PeerList(PeerList { connected_peers }) => {
                n += connected_peers.encode(writer)?;
            }
            Self::SignalRequest(SignalRequest {
                source,
                destination,
            }) => {
                n += source.encode(writer)?;
                n += destination.encode(writer)?;
            }
            Self::Signal(Signal {
                source,
                destination,
                nonce,
                signal,
            }) => {
                n += source.encode(writer)?;
                n += destination.encode(writer)?;
                n += nonce.encode(writer)?;
                n += signal.encode(writer)?;
            }
            Self::Disconnecting(Disconnecting {
                source,
                destination,
                reason,
                until,
            }) => {
                n += source.encode(writer)?;
                n += destination.encode(writer)?;
                n += (*reason as u8).encode(writer)?;
                n += until.encode(writer)?;
            }
            Self::Application { data, .. } => {
                writer.write_all(data)?;
                n += data.len();
            }
        }
        Ok(n)
    }
}

impl Decode for Message {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let type_id = u16::decode(reader)?;

        match MessageType::try_from(type_id) {
            Ok(MessageType::Identify) => {
                let identity = Identity::decode(reader)?;
                let version = Version::decode(reader)?;
                let port = Option::<u16>::decode(reader)?;
                let name = Option::<String>::decode(reader)?;
                let is_worker = bool::decode(reader)?;

                Ok(Self::Identify(Identify {
                    identity,
                    version,
                    port,
                    name,
                    is_worker,
                }))
            }
            Ok(MessageType::PeerList) => {
                let connected_peers = Vec::<PeerEntry>::decode(reader)?;

                Ok(Self::PeerList(PeerList { connected_peers }))
            }
            Ok(MessageType::SignalRequest) => {
                let source = Identity::decode(reader)?;
                let destination = Identity::decode(reader)?;

                Ok(Self::SignalRequest(SignalRequest {
                    source,
                    destination,
                }))
            }
            Ok(MessageType::Signal) => {
                let source = Identity::decode(reader)?;
                let destination = Identity::decode(reader)?;
                let nonce = Nonce::decode(reader)?;
                let signal = Vec::<u8>::decode(reader)?;

                Ok(Self::Signal(Signal {
                    source,
                    destination,
                    nonce,
                    signal,
                }))
            }
            Ok(MessageType::Disconnecting) => {
                let source = Identity::decode(reader)?;
                let destination = Option::<Identity>::decode(reader)?;
                let reason = DisconnectReason::try_from(u8::decode(reader)?)
                    .map_err(wire::Error::InvalidDisconnectReason)?;
                let until = Timestamp::decode(reader)?;

                Ok(Self::Disconnecting(Disconnecting {
                    source,
                    destination,
                    reason,
                    until,
                }))
            }
            Err(kind) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;

                Ok(Self::Application { kind, data })
            }
        }
    }
}
