//! Key manager statuses and worker-enclave protocol types.
use crate::{
    beacon::EpochTime,
    crypto::signature::{PublicKey, Signature, Signer},
    error::KeyManagerError,
    namespace::Namespace,
    policy::SignedPolicy,
    secrets::SignedEncryptedEphemeralSecret,
};

/// Name of the `init` enclave method.
pub const METHOD_INIT: &str = "init";
/// Name of the `get_public_key` enclave method.
pub const METHOD_GET_PUBLIC_KEY: &str = "get_public_key";
/// Name of the `get_public_ephemeral_key` enclave method.
pub const METHOD_GET_PUBLIC_EPHEMERAL_KEY: &str = "get_public_ephemeral_key";
/// Name of the `generate_ephemeral_secret` enclave method.
pub const METHOD_GENERATE_EPHEMERAL_SECRET: &str = "generate_ephemeral_secret";
/// Name of the `load_ephemeral_secret` enclave method.
pub const METHOD_LOAD_EPHEMERAL_SECRET: &str = "load_ephemeral_secret";

/// Context used to sign key manager enclave init responses.
pub const INIT_RESPONSE_SIGNATURE_CONTEXT: &[u8] = b"oasis-core/keymanager: init response";

/// Size of the master secret verification checksum in bytes.
pub const CHECKSUM_SIZE: usize = 32;

/// Key manager status as recorded by the consensus layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct Status {
    /// Identifier of the key manager runtime.
    pub id: Namespace,
    /// True iff the key manager is done initializing.
    pub is_initialized: bool,
    /// True iff the key manager is secure.
    pub is_secure: bool,
    /// Key manager master secret verification checksum.
    pub checksum: Vec<u8>,
    /// List of currently active key manager node identifiers.
    pub nodes: Vec<PublicKey>,
    /// Key manager access control policy.
    #[cbor(optional)]
    pub policy: Option<SignedPolicy>,
    /// Runtime signing key of the key manager.
    #[cbor(optional)]
    pub rsk: Option<PublicKey>,
}

impl Status {
    /// Perform basic structural validity checks.
    pub fn validate_basic(&self) -> Result<(), KeyManagerError> {
        if self.is_initialized && self.checksum.len() != CHECKSUM_SIZE {
            return Err(KeyManagerError::InvalidArgument);
        }
        Ok(())
    }
}

/// Key manager enclave initialization request.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct InitRequest {
    /// Checksum for validating the master secret.
    pub checksum: Vec<u8>,
    /// CBOR-encoded key manager access control policy.
    pub policy: Vec<u8>,
    /// True iff the enclave may generate ephemeral secrets.
    pub may_generate: bool,
}

/// Key manager enclave initialization response.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct InitResponse {
    /// True iff the key manager is secure.
    pub is_secure: bool,
    /// Checksum for validating the master secret.
    pub checksum: Vec<u8>,
    /// Checksum of the key manager access control policy.
    pub policy_checksum: Vec<u8>,
    /// Runtime signing key of the enclave.
    #[cbor(optional)]
    pub rsk: Option<PublicKey>,
}

/// Key manager enclave initialization response signed by the enclave's RAK.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct SignedInitResponse {
    /// Initialization response.
    pub init_response: InitResponse,
    /// RAK signature over the initialization response.
    pub signature: Signature,
}

impl SignedInitResponse {
    /// Sign an initialization response with the given RAK signer.
    pub fn new(
        init_response: InitResponse,
        signer: &dyn Signer,
    ) -> Result<Self, KeyManagerError> {
        let signature = signer
            .sign(
                INIT_RESPONSE_SIGNATURE_CONTEXT,
                &cbor::to_vec(init_response.clone()),
            )
            .map_err(|_| KeyManagerError::InvalidSignature)?;
        Ok(Self {
            init_response,
            signature,
        })
    }

    /// Verify the signature against the given RAK and return the response.
    pub fn verify(&self, rak: &PublicKey) -> Result<InitResponse, KeyManagerError> {
        rak.verify(
            INIT_RESPONSE_SIGNATURE_CONTEXT,
            &cbor::to_vec(self.init_response.clone()),
            &self.signature,
        )
        .map_err(|_| KeyManagerError::InvalidSignature)?;
        Ok(self.init_response.clone())
    }
}

/// Request body of the `generate_ephemeral_secret` enclave method.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct GenerateEphemeralSecretRequest {
    /// Epoch to generate the secret for.
    pub epoch: EpochTime,
}

/// Response body of the `generate_ephemeral_secret` enclave method.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct GenerateEphemeralSecretResponse {
    /// Generated signed encrypted ephemeral secret.
    pub signed_secret: SignedEncryptedEphemeralSecret,
}

/// Request body of the `load_ephemeral_secret` enclave method.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct LoadEphemeralSecretRequest {
    /// Signed encrypted ephemeral secret to load.
    pub signed_secret: SignedEncryptedEphemeralSecret,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::signature::MemorySigner;

    #[test]
    fn test_status_validate_basic() {
        let mut status = Status::default();
        status.validate_basic().unwrap();

        status.is_initialized = true;
        assert!(status.validate_basic().is_err());

        status.checksum = vec![0; CHECKSUM_SIZE];
        status.validate_basic().unwrap();
    }

    #[test]
    fn test_signed_init_response() {
        let signer = MemorySigner::from_test_seed("init response signer");
        let response = InitResponse {
            is_secure: true,
            checksum: vec![1; CHECKSUM_SIZE],
            policy_checksum: vec![2; CHECKSUM_SIZE],
            rsk: None,
        };

        let signed = SignedInitResponse::new(response.clone(), &signer).unwrap();
        assert_eq!(signed.verify(&signer.public_key()).unwrap(), response);

        // A different RAK must not verify.
        let other = MemorySigner::from_test_seed("another signer");
        assert!(signed.verify(&other.public_key()).is_err());

        // A tampered response must not verify.
        let mut tampered = signed.clone();
        tampered.init_response.is_secure = false;
        assert!(tampered.verify(&signer.public_key()).is_err());
    }
}
