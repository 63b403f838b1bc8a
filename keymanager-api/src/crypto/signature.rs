//! Ed25519 signatures with domain separation.
use std::fmt;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::Signer as _;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use super::hash::Hash;

/// Length of a public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Length of a private key seed in bytes.
pub const PRIVATE_KEY_LENGTH: usize = 32;
/// Length of a signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Signature error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed private key")]
    MalformedPrivateKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature verification failed")]
    VerificationFailed,
}

/// An Ed25519 public key.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, cbor::Encode, cbor::Decode,
)]
#[cbor(transparent)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Construct a public key from a slice of bytes.
    ///
    /// Fails when the bytes do not encode a valid compressed curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let point =
            CompressedEdwardsY::from_slice(bytes).map_err(|_| Error::MalformedPublicKey)?;
        if point.decompress().is_none() {
            return Err(Error::MalformedPublicKey);
        }
        Ok(Self(point.to_bytes()))
    }

    /// Return a byte representation of this public key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verify a signature over a domain-separated message.
    pub fn verify(
        &self,
        context: &[u8],
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), Error> {
        let pk = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| Error::MalformedPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);

        pk.verify_strict(
            prepare_signer_message(context, message).as_ref(),
            &sig,
        )
        .map_err(|_| Error::VerificationFailed)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
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

/// An Ed25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, cbor::Encode, cbor::Decode)]
#[cbor(transparent)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Default for Signature {
    fn default() -> Self {
        Self([0; SIGNATURE_LENGTH])
    }
}

/// A public key and a signature made by the corresponding private key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct SignatureBundle {
    /// Public key that produced the signature.
    pub public_key: PublicKey,
    /// Actual signature.
    pub signature: Signature,
}

/// Prepare a message for signing by applying domain separation.
fn prepare_signer_message(context: &[u8], message: &[u8]) -> Hash {
    Hash::digest_bytes_list(&[context, message])
}

/// Common interface for signers.
pub trait Signer: Send + Sync {
    /// Public key corresponding to the signer.
    fn public_key(&self) -> PublicKey;

    /// Generate a signature over the context and message.
    fn sign(&self, context: &[u8], message: &[u8]) -> Result<Signature, Error>;
}

/// An in-memory Ed25519 signer.
pub struct MemorySigner {
    key: ed25519_dalek::SigningKey,
}

impl MemorySigner {
    /// Generate a new signer using the system entropy source.
    pub fn generate() -> Self {
        let mut seed = [0u8; PRIVATE_KEY_LENGTH];
        OsRng.fill_bytes(&mut seed);
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Construct a signer from a 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, Error> {
        let seed: [u8; PRIVATE_KEY_LENGTH] =
            seed.try_into().map_err(|_| Error::MalformedPrivateKey)?;
        Ok(Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        })
    }

    /// Deterministically construct a signer from a seed string.
    ///
    /// Only for tests and insecure deployments.
    pub fn from_test_seed(seed: &str) -> Self {
        let seed = Hash::digest_bytes(seed.as_bytes());
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed.0),
        }
    }
}

impl Signer for MemorySigner {
    fn public_key(&self) -> PublicKey {
        PublicKey(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, context: &[u8], message: &[u8]) -> Result<Signature, Error> {
        let sig = self
            .key
            .sign(prepare_signer_message(context, message).as_ref());
        Ok(Signature(sig.to_bytes()))
    }
}
