//! Encrypted ephemeral secrets.
use std::collections::{BTreeMap, HashSet};

use crate::{
    beacon::EpochTime,
    crypto::{
        signature::{PublicKey, Signature, Signer},
        x25519,
    },
    error::KeyManagerError,
    namespace::Namespace,
};

/// Context used to sign encrypted key manager ephemeral secrets.
pub const EPHEMERAL_SECRET_SIGNATURE_CONTEXT: &[u8] = b"oasis-core/keymanager: ephemeral secret";

/// A secret encrypted to the runtime encryption keys (REKs) of a committee.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct EncryptedSecret {
    /// Checksum for validating the secret.
    pub checksum: Vec<u8>,
    /// Ephemeral public key used to derive the per-REK encryption keys.
    pub pub_key: x25519::PublicKey,
    /// Nonce used to encrypt the secret.
    pub nonce: Vec<u8>,
    /// A map of REKs to ciphertexts of the secret.
    pub ciphertexts: BTreeMap<x25519::PublicKey, Vec<u8>>,
}

/// An encrypted ephemeral secret for an epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct EncryptedEphemeralSecret {
    /// Identifier of the key manager runtime.
    pub runtime_id: Namespace,
    /// Epoch in which the secret may be used.
    pub epoch: EpochTime,
    /// Encrypted secret.
    pub secret: EncryptedSecret,
}

/// An encrypted ephemeral secret signed by the generating enclave's RAK.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct SignedEncryptedEphemeralSecret {
    /// Encrypted ephemeral secret.
    pub secret: EncryptedEphemeralSecret,
    /// RAK signature over the encrypted ephemeral secret.
    pub signature: Signature,
}

impl SignedEncryptedEphemeralSecret {
    /// Sign an encrypted ephemeral secret with the given RAK signer.
    pub fn new(
        secret: EncryptedEphemeralSecret,
        signer: &dyn Signer,
    ) -> Result<Self, KeyManagerError> {
        let signature = signer
            .sign(
                EPHEMERAL_SECRET_SIGNATURE_CONTEXT,
                &cbor::to_vec(secret.clone()),
            )
            .map_err(|_| KeyManagerError::InvalidSignature)?;
        Ok(Self { secret, signature })
    }

    /// Verify that the secret is for the given epoch, is encrypted to exactly the
    /// given committee REKs and was signed with the given RAK.
    pub fn verify(
        &self,
        epoch: EpochTime,
        reks: &HashSet<x25519::PublicKey>,
        rak: &PublicKey,
    ) -> Result<(), KeyManagerError> {
        // The secret must be for the given epoch.
        if self.secret.epoch != epoch {
            return Err(KeyManagerError::InvalidEpoch);
        }

        // The secret must be encrypted to all committee members and no one else.
        let ciphertexts = &self.secret.secret.ciphertexts;
        if ciphertexts.is_empty()
            || ciphertexts.len() != reks.len()
            || ciphertexts.keys().any(|rek| !reks.contains(rek))
        {
            return Err(KeyManagerError::InvalidCiphertext);
        }

        // The signature must be valid under the generating enclave's RAK.
        rak.verify(
            EPHEMERAL_SECRET_SIGNATURE_CONTEXT,
            &cbor::to_vec(self.secret.clone()),
            &self.signature,
        )
        .map_err(|_| KeyManagerError::InvalidSignature)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::signature::MemorySigner;

    fn test_secret(epoch: EpochTime, reks: &[x25519::PublicKey]) -> EncryptedEphemeralSecret {
        EncryptedEphemeralSecret {
            runtime_id: Namespace::from([1; 32]),
            epoch,
            secret: EncryptedSecret {
                checksum: vec![4; 32],
                pub_key: x25519::PrivateKey::from([5; 32]).public_key(),
                nonce: vec![6; 15],
                ciphertexts: reks.iter().map(|rek| (*rek, vec![7; 48])).collect(),
            },
        }
    }

    #[test]
    fn test_verify() {
        let signer = MemorySigner::from_test_seed("ephemeral secret signer");
        let rak = signer.public_key();
        let rek = x25519::PrivateKey::from([8; 32]).public_key();
        let reks = HashSet::from([rek]);

        let signed =
            SignedEncryptedEphemeralSecret::new(test_secret(10, &[rek]), &signer).unwrap();
        signed.verify(10, &reks, &rak).unwrap();

        // Wrong epoch.
        assert!(matches!(
            signed.verify(11, &reks, &rak),
            Err(KeyManagerError::InvalidEpoch)
        ));

        // Wrong committee.
        let other_rek = x25519::PrivateKey::from([9; 32]).public_key();
        assert!(matches!(
            signed.verify(10, &HashSet::from([other_rek]), &rak),
            Err(KeyManagerError::InvalidCiphertext)
        ));
        assert!(matches!(
            signed.verify(10, &HashSet::from([rek, other_rek]), &rak),
            Err(KeyManagerError::InvalidCiphertext)
        ));

        // No ciphertexts.
        let empty =
            SignedEncryptedEphemeralSecret::new(test_secret(10, &[]), &signer).unwrap();
        assert!(matches!(
            empty.verify(10, &HashSet::new(), &rak),
            Err(KeyManagerError::InvalidCiphertext)
        ));

        // Wrong RAK.
        let other_rak = MemorySigner::from_test_seed("another signer").public_key();
        assert!(matches!(
            signed.verify(10, &reks, &other_rak),
            Err(KeyManagerError::InvalidSignature)
        ));

        // Tampered secret.
        let mut tampered = signed.clone();
        tampered.secret.epoch = 11;
        assert!(matches!(
            tampered.verify(11, &reks, &rak),
            Err(KeyManagerError::InvalidSignature)
        ));
    }
}
