//! Agent version strings.
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A node's advertised version: `agent/protocol/client`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    /// Software distribution, eg. `weft`.
    pub agent: String,
    /// Overlay protocol number. The only field that determines compatibility.
    pub protocol: u32,
    /// Client flavor, eg. `cli`.
    pub client: String,
}

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("malformed version string `{0}`")]
    Malformed(String),
    #[error("invalid protocol number: {0}")]
    Protocol(#[from] ParseIntError),
}

impl Version {
    pub fn new(agent: impl ToString, protocol: u32, client: impl ToString) -> Self {
        Self {
            agent: agent.to_string(),
            protocol,
            client: client.to_string(),
        }
    }

    /// Two versions interoperate iff their protocol numbers are equal.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.protocol == other.protocol
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.agent, self.protocol, self.client)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [agent, protocol, client] if !agent.is_empty() && !client.is_empty() => Ok(Self {
                agent: (*agent).to_owned(),
                protocol: protocol.parse()?,
                client: (*client).to_owned(),
            }),
            _ => Err(VersionError::Malformed(s.to_owned())),
        }
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}
