//! Worker configuration.
use anyhow::{anyhow, Result};

use keymanager_api::{crypto::signature::PublicKey, namespace::Namespace};

use crate::access::PeerId;

/// Key manager worker configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identifier of the hosted key manager runtime.
    pub runtime_id: Namespace,
    /// Public identity of the node hosting the worker.
    pub node_id: PublicKey,
    /// True iff the enclave may generate ephemeral secrets.
    pub may_generate: bool,
    /// Peers that bypass the runtime access control checks.
    pub private_peers: Vec<PeerId>,
}

impl Config {
    /// Create a new configuration.
    ///
    /// Private peers are configured as p2p public keys; a key that cannot be
    /// translated into a peer identifier rejects the whole configuration
    /// instead of silently shrinking the bypass set.
    pub fn new(
        runtime_id: Namespace,
        node_id: PublicKey,
        may_generate: bool,
        private_peer_keys: &[PublicKey],
    ) -> Result<Self> {
        let mut private_peers = Vec::with_capacity(private_peer_keys.len());
        for pk in private_peer_keys {
            let peer = PeerId::from_public_key(pk)
                .map_err(|err| anyhow!("malformed private peer public key {pk}: {err}"))?;
            private_peers.push(peer);
        }

        Ok(Self {
            runtime_id,
            node_id,
            may_generate,
            private_peers,
        })
    }
}
