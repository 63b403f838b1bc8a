//! Key manager errors.
use thiserror::Error;

/// Key manager error.
#[derive(Error, Debug)]
pub enum KeyManagerError {
    #[error("malformed request or missing required field")]
    InvalidArgument,

    #[error("no status for the key manager runtime")]
    NoSuchStatus,

    #[error("ephemeral secret not published")]
    NoSuchEphemeralSecret,

    #[error("caller is not authorized")]
    NotAuthorized,

    #[error("unsupported RPC kind")]
    UnsupportedRpcKind,

    #[error("unknown TEE hardware")]
    UnknownTEE,

    #[error("malformed enclave response")]
    MalformedResponse,

    #[error("enclave error: {0}")]
    EnclaveError(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("invalid epoch")]
    InvalidEpoch,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("invalid signature")]
    InvalidSignature,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
