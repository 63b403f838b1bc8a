//! Runtime host interface for the hosted key manager enclave.
use async_trait::async_trait;
use tokio::sync::mpsc;

use keymanager_api::{
    registry::{CapabilityTEE, Version},
    KeyManagerError,
};

use crate::enclave_rpc::Kind;

/// Local status of the hosted enclave.
#[derive(Clone, Debug)]
pub struct RuntimeStatus {
    /// Version of the running enclave.
    pub version: Version,
    /// Attested TEE capability, when running inside a TEE.
    pub capability_tee: Option<CapabilityTEE>,
}

/// Events emitted by the runtime host.
#[derive(Clone, Debug)]
pub enum HostEvent {
    /// The enclave has started.
    Started {
        version: Version,
        capability_tee: Option<CapabilityTEE>,
    },
    /// The enclave has been updated, e.g. after an attestation refresh.
    Updated {
        capability_tee: Option<CapabilityTEE>,
    },
    /// The enclave has stopped.
    Stopped,
    /// The enclave failed to start.
    FailedToStart,
}

/// Host of the key manager enclave.
#[async_trait]
pub trait EnclaveHost: Send + Sync {
    /// Provision the enclave from the bundle, returning the provisioned
    /// version. Exactly one version is provisioned.
    async fn provision(&self) -> Result<Version, KeyManagerError>;

    /// Start the provisioned enclave.
    async fn start(&self) -> Result<(), KeyManagerError>;

    /// Stop the enclave.
    async fn stop(&self);

    /// Subscribe to enclave lifecycle events.
    fn watch_events(&self) -> mpsc::Receiver<HostEvent>;

    /// Dispatch an RPC call into the enclave.
    async fn call(&self, kind: Kind, request: Vec<u8>) -> Result<Vec<u8>, KeyManagerError>;
}
