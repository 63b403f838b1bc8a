//! Registry descriptors consumed by the key manager worker.
use std::fmt;

use crate::{
    crypto::{signature::PublicKey, x25519},
    namespace::Namespace,
};

/// TEE hardware implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
#[repr(u8)]
pub enum TEEHardware {
    /// Non-TEE implementation.
    #[default]
    Invalid = 0,
    /// Intel SGX.
    IntelSGX = 1,
    /// Intel TDX.
    IntelTDX = 2,
}

/// A TEE capability attested for a hosted runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct CapabilityTEE {
    /// Hardware type.
    pub hardware: TEEHardware,
    /// Runtime attestation key.
    pub rak: PublicKey,
    /// Runtime encryption key.
    #[cbor(optional)]
    pub rek: Option<x25519::PublicKey>,
    /// Attestation evidence.
    pub attestation: Vec<u8>,
}

/// Information about the node's p2p transport endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct P2PInfo {
    /// Public key used for p2p communication.
    pub id: PublicKey,
}

/// A node registry descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct Node {
    /// Public node identity.
    pub id: PublicKey,
    /// P2P transport information.
    pub p2p: P2PInfo,
    /// TEE capability of the node's key manager runtime, if any.
    #[cbor(optional)]
    pub tee: Option<CapabilityTEE>,
}

/// Kind of a registered runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
#[repr(u8)]
pub enum RuntimeKind {
    /// Invalid runtime kind.
    #[default]
    Invalid = 0,
    /// Generic compute runtime.
    Compute = 1,
    /// Key manager runtime.
    KeyManager = 2,
}

/// A runtime registry descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct Runtime {
    /// Runtime identifier.
    pub id: Namespace,
    /// Runtime kind.
    pub kind: RuntimeKind,
    /// Identifier of the key manager runtime used by this runtime, if any.
    #[cbor(optional)]
    pub key_manager: Option<Namespace>,
}

/// A component version.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, cbor::Encode, cbor::Decode,
)]
pub struct Version {
    #[cbor(optional)]
    pub major: u16,
    #[cbor(optional)]
    pub minor: u16,
    #[cbor(optional)]
    pub patch: u16,
}

impl Version {
    /// Create a new version.
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
