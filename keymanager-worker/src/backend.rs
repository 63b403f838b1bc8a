//! Interfaces of the external collaborators the worker is wired to.
//!
//! Each backend is a narrow capability: the worker only sees the operations
//! it actually needs. Concrete implementations are injected at construction.
use async_trait::async_trait;
use tokio::sync::mpsc;

use keymanager_api::{
    beacon::EpochTime,
    crypto::signature::PublicKey,
    namespace::Namespace,
    policy::SignedPolicy,
    registry::{CapabilityTEE, Node, Runtime, Version},
    scheduler::Committee,
    secrets::SignedEncryptedEphemeralSecret,
    types::Status,
    KeyManagerError,
};

/// Name of the UpdatePolicy transaction method.
pub const METHOD_UPDATE_POLICY: &str = "keymanager.UpdatePolicy";
/// Name of the PublishEphemeralSecret transaction method.
pub const METHOD_PUBLISH_EPHEMERAL_SECRET: &str = "keymanager.PublishEphemeralSecret";

/// Gas operation identifier of UpdatePolicy transactions.
pub const GAS_OP_UPDATE_POLICY: &str = "update_policy";
/// Gas operation identifier of PublishEphemeralSecret transactions.
pub const GAS_OP_PUBLISH_EPHEMERAL_SECRET: &str = "publish_ephemeral_secret";

/// Default gas cost of key manager transactions.
pub const DEFAULT_GAS_COST: u64 = 1000;

/// An unsigned consensus transaction produced by the worker.
///
/// Transactions are signed by the node signer on submission.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Method name.
    pub method: &'static str,
    /// Method body.
    pub body: cbor::Value,
}

/// Construct an UpdatePolicy transaction.
pub fn update_policy_tx(policy: SignedPolicy) -> Transaction {
    Transaction {
        method: METHOD_UPDATE_POLICY,
        body: cbor::to_value(policy),
    }
}

/// Construct a PublishEphemeralSecret transaction.
pub fn publish_ephemeral_secret_tx(secret: SignedEncryptedEphemeralSecret) -> Transaction {
    Transaction {
        method: METHOD_PUBLISH_EPHEMERAL_SECRET,
        body: cbor::to_value(secret),
    }
}

/// Consensus key manager backend.
#[async_trait]
pub trait KeyManagerBackend: Send + Sync {
    /// Get the latest status of the given key manager runtime.
    async fn get_status(&self, runtime_id: Namespace) -> Result<Status, KeyManagerError>;

    /// Get the ephemeral secret published for the given runtime and epoch.
    ///
    /// Fails with `KeyManagerError::NoSuchEphemeralSecret` when no secret has
    /// been published yet.
    async fn get_ephemeral_secret(
        &self,
        runtime_id: Namespace,
        epoch: EpochTime,
    ) -> Result<SignedEncryptedEphemeralSecret, KeyManagerError>;

    /// Subscribe to key manager status updates.
    fn watch_statuses(&self) -> mpsc::Receiver<Status>;

    /// Subscribe to published ephemeral secrets.
    fn watch_ephemeral_secrets(&self) -> mpsc::Receiver<SignedEncryptedEphemeralSecret>;
}

/// Consensus block and transaction services.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Subscribe to consensus block heights.
    fn watch_blocks(&self) -> mpsc::Receiver<u64>;

    /// Sign the transaction with the node signer, submit it and wait for
    /// inclusion in a block.
    async fn submit_tx(&self, tx: Transaction) -> Result<(), KeyManagerError>;
}

/// Registry of nodes and runtimes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Get all registered runtimes.
    async fn get_runtimes(&self) -> Result<Vec<Runtime>, KeyManagerError>;

    /// Get the descriptor of the given node.
    async fn get_node(&self, id: PublicKey) -> Result<Node, KeyManagerError>;

    /// Subscribe to runtime registrations.
    fn watch_runtimes(&self) -> mpsc::Receiver<Runtime>;

    /// Subscribe to node descriptor updates.
    fn watch_nodes(&self) -> mpsc::Receiver<Node>;
}

/// Scheduler committee queries.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Get the currently elected committees of the given runtime.
    async fn get_committees(
        &self,
        runtime_id: Namespace,
    ) -> Result<Vec<Committee>, KeyManagerError>;
}

/// Beacon epoch queries.
#[async_trait]
pub trait Beacon: Send + Sync {
    /// Get the current epoch.
    async fn get_epoch(&self) -> Result<EpochTime, KeyManagerError>;

    /// Get the height of the first block of the given epoch.
    async fn get_epoch_block(&self, epoch: EpochTime) -> Result<u64, KeyManagerError>;

    /// Get the epoch interval in blocks.
    async fn epoch_interval(&self) -> Result<u64, KeyManagerError>;

    /// Subscribe to epoch transitions.
    ///
    /// The current epoch, if known, is delivered first.
    fn watch_epochs(&self) -> mpsc::Receiver<EpochTime>;
}

/// Node availability advertised to the registry for the hosted key manager
/// runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct RegistrationInfo {
    /// Version of the hosted runtime.
    pub version: Version,
    /// CBOR-encoded signed init response.
    pub extra_info: Vec<u8>,
    /// Current TEE capability.
    #[cbor(optional)]
    pub capability_tee: Option<CapabilityTEE>,
}

/// Node registration service.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Advertise availability of the hosted key manager runtime.
    async fn register(&self, info: RegistrationInfo) -> Result<(), KeyManagerError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tx_constructors() {
        let tx = update_policy_tx(SignedPolicy::default());
        assert_eq!(tx.method, "keymanager.UpdatePolicy");
        let policy: SignedPolicy = cbor::from_value(tx.body).unwrap();
        assert_eq!(policy, SignedPolicy::default());

        let secret = SignedEncryptedEphemeralSecret::default();
        let tx = publish_ephemeral_secret_tx(secret.clone());
        assert_eq!(tx.method, "keymanager.PublishEphemeralSecret");
        let decoded: SignedEncryptedEphemeralSecret = cbor::from_value(tx.body).unwrap();
        assert_eq!(decoded, secret);
    }
}
