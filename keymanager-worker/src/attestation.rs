//! Selection of attested keys for enclave response verification.
use keymanager_api::{
    crypto::{signature::PublicKey, x25519},
    insecure,
    registry::{CapabilityTEE, TEEHardware},
    KeyManagerError,
};

use crate::host::RuntimeStatus;

/// The RAK that responses of the hosted enclave must verify under.
///
/// Without TEE hardware the well-known insecure RAK is used.
pub(crate) fn runtime_attestation_key(
    status: &RuntimeStatus,
) -> Result<PublicKey, KeyManagerError> {
    match &status.capability_tee {
        None => Ok(insecure::insecure_rak()),
        Some(capability) => match capability.hardware {
            TEEHardware::Invalid => Ok(insecure::insecure_rak()),
            TEEHardware::IntelSGX => Ok(capability.rak),
            _ => Err(KeyManagerError::UnknownTEE),
        },
    }
}

/// The REK that ephemeral secrets for the given committee node must be
/// encrypted to.
///
/// Returns `None` when the node advertises no REK; such a node cannot
/// receive secrets.
pub(crate) fn runtime_encryption_key(
    tee: Option<&CapabilityTEE>,
) -> Result<Option<x25519::PublicKey>, KeyManagerError> {
    match tee {
        None => Ok(Some(insecure::insecure_rek())),
        Some(capability) => match capability.hardware {
            TEEHardware::Invalid => Ok(Some(insecure::insecure_rek())),
            TEEHardware::IntelSGX => Ok(capability.rek),
            _ => Err(KeyManagerError::UnknownTEE),
        },
    }
}
