//! The local side of every connection.
use weft::crypto::{Boxer, Nonce, Sealed};
use weft::{Identity, Version};

use crate::service::message::Identify;

/// The local node: its identity material and sealing primitive. One per
/// service.
#[derive(Debug)]
pub struct LocalPeer<G> {
    /// Our identity.
    pub identity: Identity,
    /// Our version.
    pub version: Version,
    /// Our display name, included in the handshake when set.
    pub name: Option<String>,
    /// The port we accept direct connections on, if we listen.
    pub port: Option<u16>,
    /// Whether we are a worker node.
    pub is_worker: bool,

    /// Sealing primitive for signalling payloads.
    boxer: G,
}

impl<G: Boxer> LocalPeer<G> {
    pub fn new(identity: Identity, version: Version, boxer: G) -> Self {
        Self {
            identity,
            version,
            name: None,
            port: None,
            is_worker: false,
            boxer,
        }
    }

    /// The handshake message we send on every fresh connection.
    pub fn identify(&self) -> Identify {
        Identify {
            identity: self.identity,
            version: self.version.clone(),
            port: self.port,
            name: self.name.clone(),
            is_worker: self.is_worker,
        }
    }

    pub fn seal(&self, plaintext: &[u8], to: &Identity) -> Sealed {
        self.boxer.seal(plaintext, to)
    }

    pub fn unseal(&self, ciphertext: &[u8], nonce: &Nonce, from: &Identity) -> Option<Vec<u8>> {
        self.boxer.unseal(ciphertext, nonce, from)
    }
}
