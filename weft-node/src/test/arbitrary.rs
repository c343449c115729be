//! Test data generators.
use weft::identity::{Identity, IDENTITY_LENGTH};

/// Generate a random identity.
pub fn identity(rng: &mut fastrand::Rng) -> Identity {
    let mut bytes = [0u8; IDENTITY_LENGTH];
    for byte in bytes.iter_mut() {
        *byte = rng.u8(..);
    }
    Identity::from(bytes)
}

/// An identity with all bytes set to `byte`. Handy for forcing a specific
/// initiator ordering: lower bytes sort first in the rendered form.
pub fn identity_from(byte: u8) -> Identity {
    Identity::from([byte; IDENTITY_LENGTH])
}

/// Newtype for property tests, since we can't implement foreign traits
/// on [`Identity`] here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SomeIdentity(pub Identity);

impl qcheck::Arbitrary for SomeIdentity {
    fn arbitrary(g: &mut qcheck::Gen) -> Self {
        let mut bytes = [0u8; IDENTITY_LENGTH];
        for byte in bytes.iter_mut() {
            *byte = u8::arbitrary(g);
        }
        Self(Identity::from(bytes))
    }
}
