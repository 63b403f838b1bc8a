//! Insecure keys used when the enclave runs outside a TEE.
//!
//! These are process-wide constants built once from fixed seeds and never
//! mutated afterwards. Responses signed with the insecure RAK carry no
//! security guarantees whatsoever.
use once_cell::sync::Lazy;

use crate::crypto::{
    hash::Hash,
    signature::{MemorySigner, PublicKey, Signer},
    x25519,
};

/// Seed for deriving the insecure runtime attestation key.
const INSECURE_RAK_SEED: &str = "ekiden test key manager RAK seed";

/// Seed for deriving the insecure runtime encryption key.
const INSECURE_REK_SEED: &str = "ekiden test key manager REK seed";

static INSECURE_RAK_SIGNER: Lazy<MemorySigner> =
    Lazy::new(|| MemorySigner::from_test_seed(INSECURE_RAK_SEED));

static INSECURE_REK_KEY: Lazy<x25519::PrivateKey> =
    Lazy::new(|| x25519::PrivateKey::from(Hash::digest_bytes(INSECURE_REK_SEED.as_bytes()).0));

/// Signer for the insecure runtime attestation key.
pub fn insecure_rak_signer() -> &'static MemorySigner {
    &INSECURE_RAK_SIGNER
}

/// Public part of the insecure runtime attestation key.
pub fn insecure_rak() -> PublicKey {
    INSECURE_RAK_SIGNER.public_key()
}

/// Insecure runtime encryption key.
pub fn insecure_rek_key() -> &'static x25519::PrivateKey {
    &INSECURE_REK_KEY
}

/// Public part of the insecure runtime encryption key.
pub fn insecure_rek() -> x25519::PublicKey {
    INSECURE_REK_KEY.public_key()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(insecure_rak(), insecure_rak_signer().public_key());
        assert_eq!(insecure_rek(), insecure_rek_key().public_key());
        assert_ne!(insecure_rak().as_bytes(), insecure_rek().as_bytes());
    }
}
