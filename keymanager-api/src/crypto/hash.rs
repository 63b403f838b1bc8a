//! SHA-512/256 hashes.
use std::fmt;

use sha2::{Digest, Sha512_256};

/// Size of a hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A SHA-512/256 hash.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, cbor::Encode, cbor::Decode,
)]
#[cbor(transparent)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    /// Compute a hash over the input data.
    pub fn digest_bytes(data: &[u8]) -> Self {
        Self::digest_bytes_list(&[data])
    }

    /// Compute a hash over a list of byte slices, in order.
    pub fn digest_bytes_list(data: &[&[u8]]) -> Self {
        let mut digest = Sha512_256::new();
        for datum in data {
            digest.update(datum);
        }
        Self(digest.finalize().into())
    }

    /// Return a byte representation of this hash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
