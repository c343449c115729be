//! Node identities and the ordering predicates derived from them.
use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of an identity, in bytes.
pub const IDENTITY_LENGTH: usize = 32;

/// Base64 engine used for the textual form. URL-safe, unpadded.
const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid length {0}")]
    InvalidLength(usize),
    #[error("invalid base64 string: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// The public identity of a node. Opaque to the overlay; rendered as
/// URL-safe base64 in text and on the wire where strings are expected.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Identity([u8; IDENTITY_LENGTH]);

impl Identity {
    /// Return the raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.0
    }

    /// The truncated form used in human-readable labels.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(7);
        s
    }
}

/// Check whether a string is a syntactically valid identity.
pub fn is_valid(s: &str) -> bool {
    Identity::from_str(s).is_ok()
}

/// Whether `a` is the designated initiator for the pair `{a, b}`.
///
/// The order is lexicographic on the rendered form, so for any two
/// distinct identities exactly one side initiates.
pub fn can_initiate(a: &Identity, b: &Identity) -> bool {
    a.to_string() < b.to_string()
}

/// Given two live connections to the same identity, whether the one owned
/// by `keep` survives. Consistent with [`can_initiate`] by construction.
pub fn can_keep_duplicate(keep: &Identity, other: &Identity) -> bool {
    can_initiate(keep, other)
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ENGINE.encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = ENGINE.decode(s)?;
        Self::try_from(bytes.as_slice())
    }
}

impl From<[u8; IDENTITY_LENGTH]> for Identity {
    fn from(bytes: [u8; IDENTITY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Identity {
    type Error = IdentityError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        match <[u8; IDENTITY_LENGTH]>::try_from(bytes) {
            Ok(array) => Ok(Self(array)),
            Err(_) => Err(IdentityError::InvalidLength(bytes.len())),
        }
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use qcheck::Arbitrary;
    use qcheck_macros::quickcheck;

    impl Arbitrary for Identity {
        fn arbitrary(g: &mut qcheck::Gen) -> Self {
            let mut bytes = [0u8; IDENTITY_LENGTH];
            for byte in bytes.iter_mut() {
                *byte = u8::arbitrary(g);
            }
            Self(bytes)
        }
    }

    #[quickcheck]
    fn prop_encode_decode(id: Identity) {
        assert_eq!(Identity::from_str(&id.to_string()).unwrap(), id);
    }

    #[quickcheck]
    fn prop_exactly_one_initiator(a: Identity, b: Identity) {
        if a == b {
            assert!(!can_initiate(&a, &b));
            assert!(!can_initiate(&b, &a));
        } else {
            assert_ne!(can_initiate(&a, &b), can_initiate(&b, &a));
        }
    }

    #[quickcheck]
    fn prop_keep_duplicate_consistency(a: Identity, b: Identity) {
        if a != b {
            assert_eq!(can_keep_duplicate(&a, &b), can_initiate(&a, &b));
            assert_ne!(can_keep_duplicate(&a, &b), can_keep_duplicate(&b, &a));
        }
    }

    #[test]
    fn test_valid() {
        let id = Identity::from([7u8; IDENTITY_LENGTH]);
        assert!(is_valid(&id.to_string()));
        assert!(!is_valid("not base64!"));
        assert!(!is_valid("c2hvcnQ")); // valid base64, wrong length
    }

    #[test]
    fn test_short() {
        let id = Identity::from([0u8; IDENTITY_LENGTH]);
        assert_eq!(id.short().len(), 7);
        assert!(id.to_string().starts_with(&id.short()));
    }
}
