#![allow(clippy::too_many_arguments)]
#![allow(clippy::collapsible_if)]
#![warn(clippy::unwrap_used)]
pub mod clock;
pub mod service;
#[cfg(test)]
mod test;
pub mod wire;

use std::fmt;

pub use localtime::{LocalDuration, LocalTime};
pub use weft::{collections, crypto, events, identity, version, Identity, Version};

/// Overlay protocol number spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Direction of a transport connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Link {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

impl Link {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Inbound)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

pub mod prelude {
    pub use crate::clock::Timestamp;
    pub use crate::service::{Config, DisconnectReason, Event, Message, PeerId, Service};
    pub use crate::{Identity, Link, LocalDuration, LocalTime, Version};
}
