//! X25519 key pairs, used as runtime encryption keys (REKs).
use std::fmt;

use rand::rngs::OsRng;

/// Length of a public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Length of a private key in bytes.
pub const PRIVATE_KEY_LENGTH: usize = 32;

/// An X25519 public key.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, cbor::Encode, cbor::Decode,
)]
#[cbor(transparent)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Return a byte representation of this public key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// An X25519 private key.
///
/// Key material is zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(pub x25519_dalek::StaticSecret);

impl PrivateKey {
    /// Generate a new private key using the system entropy source.
    pub fn generate() -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    /// Public key corresponding to the private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }
}

impl From<[u8; PRIVATE_KEY_LENGTH]> for PrivateKey {
    fn from(bytes: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_public_key_derivation() {
        let sk = PrivateKey::from([1u8; PRIVATE_KEY_LENGTH]);
        assert_eq!(sk.public_key(), sk.clone().public_key());

        let other = PrivateKey::from([2u8; PRIVATE_KEY_LENGTH]);
        assert_ne!(sk.public_key(), other.public_key());
    }

    #[test]
    fn test_cbor_roundtrip() {
        let pk = PrivateKey::generate().public_key();
        let decoded: PublicKey = cbor::from_slice(&cbor::to_vec(pk)).unwrap();
        assert_eq!(decoded, pk);
    }
}
