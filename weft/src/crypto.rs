//! Sealed-box interface consumed by the overlay.
//!
//! The overlay never touches key material: signalling payloads are sealed
//! and unsealed through the [`Boxer`] trait, implemented by the host's
//! cryptographic layer.
use crate::identity::Identity;

/// Length of a sealing nonce, in bytes.
pub const NONCE_LENGTH: usize = 24;

/// A single-use sealing nonce.
pub type Nonce = [u8; NONCE_LENGTH];

/// An encrypted payload together with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
}

/// Authenticated encryption towards a remote identity.
pub trait Boxer {
    /// Seal a plaintext for the given recipient.
    fn seal(&self, plaintext: &[u8], to: &Identity) -> Sealed;

    /// Open a payload sealed by `from`. Returns `None` if the ciphertext
    /// does not authenticate.
    fn unseal(&self, ciphertext: &[u8], nonce: &Nonce, from: &Identity) -> Option<Vec<u8>>;
}

impl<T: Boxer> Boxer for &T {
    fn seal(&self, plaintext: &[u8], to: &Identity) -> Sealed {
        (*self).seal(plaintext, to)
    }

    fn unseal(&self, ciphertext: &[u8], nonce: &Nonce, from: &Identity) -> Option<Vec<u8>> {
        (*self).unseal(ciphertext, nonce, from)
    }
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    //! Mock sealing for tests.
    use std::cell::RefCell;

    use super::*;

    /// Bytes prepended to every plaintext so that unsealing with the wrong
    /// identity or nonce is detected.
    const TAG: &[u8; 4] = b"weft";

    /// An invertible, keyless stand-in for the real sealing layer. The
    /// "shared secret" between two identities is the XOR of their bytes,
    /// which is symmetric in the two parties.
    #[derive(Debug)]
    pub struct MockBoxer {
        local: Identity,
        rng: RefCell<fastrand::Rng>,
    }

    impl MockBoxer {
        pub fn new(local: Identity, rng: fastrand::Rng) -> Self {
            Self {
                local,
                rng: RefCell::new(rng),
            }
        }

        fn keystream(&self, other: &Identity, nonce: &Nonce, len: usize) -> Vec<u8> {
            let local = self.local.as_bytes();
            let other = other.as_bytes();

            (0..len)
                .map(|i| local[i % local.len()] ^ other[i % other.len()] ^ nonce[i % nonce.len()])
                .collect()
        }
    }

    impl Boxer for MockBoxer {
        fn seal(&self, plaintext: &[u8], to: &Identity) -> Sealed {
            let mut nonce = [0u8; NONCE_LENGTH];
            let mut rng = self.rng.borrow_mut();
            for byte in nonce.iter_mut() {
                *byte = rng.u8(..);
            }

            let mut tagged = TAG.to_vec();
            tagged.extend_from_slice(plaintext);

            let key = self.keystream(to, &nonce, tagged.len());
            let ciphertext = tagged.iter().zip(key).map(|(b, k)| b ^ k).collect();

            Sealed { nonce, ciphertext }
        }

        fn unseal(&self, ciphertext: &[u8], nonce: &Nonce, from: &Identity) -> Option<Vec<u8>> {
            let key = self.keystream(from, nonce, ciphertext.len());
            let tagged: Vec<u8> = ciphertext.iter().zip(key).map(|(b, k)| b ^ k).collect();

            match tagged.strip_prefix(TAG.as_slice()) {
                Some(plaintext) => Some(plaintext.to_vec()),
                None => None,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_seal_unseal() {
            let rng = fastrand::Rng::with_seed(42);
            let alice = Identity::from([1u8; 32]);
            let bob = Identity::from([2u8; 32]);
            let eve = Identity::from([3u8; 32]);

            let alice_box = MockBoxer::new(alice, rng.clone());
            let bob_box = MockBoxer::new(bob, rng.clone());
            let eve_box = MockBoxer::new(eve, rng);

            let sealed = alice_box.seal(b"hello", &bob);
            assert_eq!(
                bob_box.unseal(&sealed.ciphertext, &sealed.nonce, &alice),
                Some(b"hello".to_vec())
            );
            assert_eq!(eve_box.unseal(&sealed.ciphertext, &sealed.nonce, &alice), None);
            assert_eq!(bob_box.unseal(&sealed.ciphertext, &sealed.nonce, &eve), None);
        }
    }
}
