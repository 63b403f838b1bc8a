//! Chain namespaces.
use std::{fmt, str::FromStr};

use anyhow::anyhow;

/// Size of a namespace identifier in bytes.
pub const NAMESPACE_SIZE: usize = 32;

/// A chain namespace identifying a runtime.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, cbor::Encode, cbor::Decode,
)]
#[cbor(transparent)]
pub struct Namespace(pub [u8; NAMESPACE_SIZE]);

impl Namespace {
    /// Return a byte representation of this namespace.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; NAMESPACE_SIZE]> for Namespace {
    fn from(bytes: [u8; NAMESPACE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Namespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; NAMESPACE_SIZE] = bytes
            .try_into()
            .map_err(|_| anyhow!("malformed namespace"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
