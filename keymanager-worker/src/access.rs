//! Peer-to-runtime access control table.
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use keymanager_api::{
    crypto::{
        hash::Hash,
        signature::{self, PublicKey},
    },
    namespace::Namespace,
    registry::Node,
};

use crate::logger::get_logger;

/// Domain separation context for deriving peer identifiers from p2p public keys.
const PEER_ID_CONTEXT: &[u8] = b"oasis-core/p2p: peer id";

/// Identifier of a peer on the p2p transport, derived from the peer's p2p
/// public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(Hash);

impl PeerId {
    /// Derive the peer identifier corresponding to a p2p public key.
    ///
    /// Fails when the public key is not a valid curve point, since such a key
    /// can never belong to a live transport peer.
    pub fn from_public_key(public_key: &PublicKey) -> Result<Self, signature::Error> {
        let public_key = PublicKey::from_bytes(public_key.as_bytes())?;
        Ok(Self(Hash::digest_bytes_list(&[
            PEER_ID_CONTEXT,
            public_key.as_bytes(),
        ])))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Table of peers permitted to call the enclave on behalf of client runtimes.
///
/// Two mirrored maps are maintained: peer to runtimes, and runtime to the
/// ordered list of its current committee peers. An entry for `(peer, runtime)`
/// exists iff the peer is a current executor committee member for the runtime.
pub struct AccessList {
    /// Map of peers to the runtimes they may query on behalf of.
    peers: HashMap<PeerId, HashSet<Namespace>>,
    /// Map of runtimes to their current committee peers.
    by_runtime: HashMap<Namespace, Vec<PeerId>>,

    logger: slog::Logger,
}

impl AccessList {
    /// Create an empty access list.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            by_runtime: HashMap::new(),
            logger: get_logger("worker/keymanager/acl"),
        }
    }

    /// Whether the peer may call the enclave on behalf of any runtime.
    pub fn is_authorized(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Runtimes the peer may call the enclave on behalf of.
    pub fn runtimes(&self, peer: &PeerId) -> Option<&HashSet<Namespace>> {
        self.peers.get(peer)
    }

    /// Current committee peers of the given runtime.
    pub fn runtime_peers(&self, runtime_id: &Namespace) -> Option<&Vec<PeerId>> {
        self.by_runtime.get(runtime_id)
    }

    /// Replace the set of peers permitted on behalf of the given runtime with
    /// the peers derived from the given committee nodes.
    ///
    /// Nodes whose p2p public key cannot be translated into a peer identifier
    /// are skipped with a warning.
    pub fn update_runtime(&mut self, runtime_id: Namespace, nodes: &[Node]) {
        // Drop all previous entries of this runtime.
        for peer in self.by_runtime.remove(&runtime_id).unwrap_or_default() {
            if let Some(runtimes) = self.peers.get_mut(&peer) {
                runtimes.remove(&runtime_id);
                if runtimes.is_empty() {
                    self.peers.remove(&peer);
                }
            }
        }

        let mut peers = Vec::with_capacity(nodes.len());
        for node in nodes {
            let peer = match PeerId::from_public_key(&node.p2p.id) {
                Ok(peer) => peer,
                Err(err) => {
                    slog::warn!(self.logger, "failed to derive peer identifier";
                        "err" => %err,
                        "node_id" => %node.id,
                    );
                    continue;
                }
            };
            self.peers.entry(peer).or_default().insert(runtime_id);
            peers.push(peer);
        }
        self.by_runtime.insert(runtime_id, peers);
    }
}

impl Default for AccessList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use keymanager_api::{
        crypto::signature::{MemorySigner, Signer},
        registry::P2PInfo,
    };

    use super::*;

    fn test_node(seed: &str) -> Node {
        let p2p_key = MemorySigner::from_test_seed(seed).public_key();
        Node {
            id: MemorySigner::from_test_seed(&format!("{seed} identity")).public_key(),
            p2p: P2PInfo { id: p2p_key },
            tee: None,
        }
    }

    /// Check that the two maps mirror each other: a peer is authorized iff it
    /// appears in some runtime's peer list.
    fn check_mirrored(acl: &AccessList) {
        let mut from_runtimes = HashSet::new();
        for peers in acl.by_runtime.values() {
            from_runtimes.extend(peers.iter().copied());
        }
        let from_peers: HashSet<_> = acl.peers.keys().copied().collect();
        assert_eq!(from_peers, from_runtimes);
    }

    #[test]
    fn test_update_runtime() {
        let runtime_a = Namespace::from([0xaa; 32]);
        let runtime_b = Namespace::from([0xbb; 32]);
        let node_1 = test_node("node 1");
        let node_2 = test_node("node 2");
        let peer_1 = PeerId::from_public_key(&node_1.p2p.id).unwrap();
        let peer_2 = PeerId::from_public_key(&node_2.p2p.id).unwrap();

        let mut acl = AccessList::new();
        assert!(!acl.is_authorized(&peer_1));

        acl.update_runtime(runtime_a, &[node_1.clone(), node_2.clone()]);
        assert!(acl.is_authorized(&peer_1));
        assert!(acl.is_authorized(&peer_2));
        assert_eq!(
            acl.runtime_peers(&runtime_a),
            Some(&vec![peer_1, peer_2]),
        );
        check_mirrored(&acl);

        // Node 2 serves two runtimes.
        acl.update_runtime(runtime_b, &[node_2.clone()]);
        assert_eq!(acl.runtimes(&peer_2).unwrap().len(), 2);
        check_mirrored(&acl);

        // Committee change drops node 2 from runtime A, but it remains
        // authorized through runtime B.
        acl.update_runtime(runtime_a, &[node_1.clone()]);
        assert!(acl.is_authorized(&peer_2));
        assert_eq!(acl.runtimes(&peer_2).unwrap().len(), 1);
        check_mirrored(&acl);

        // Emptying runtime B drops node 2 completely.
        acl.update_runtime(runtime_b, &[]);
        assert!(!acl.is_authorized(&peer_2));
        assert!(acl.is_authorized(&peer_1));
        check_mirrored(&acl);
    }

    #[test]
    fn test_malformed_p2p_key_skipped() {
        // Find a byte pattern that is not a valid curve point.
        let invalid = (0u8..=255)
            .map(|b| PublicKey::from([b; 32]))
            .find(|pk| PublicKey::from_bytes(pk.as_bytes()).is_err())
            .expect("some uniform pattern is not a curve point");

        let mut bad_node = test_node("good node");
        bad_node.p2p.id = invalid;
        let good_node = test_node("another good node");
        let good_peer = PeerId::from_public_key(&good_node.p2p.id).unwrap();

        let runtime = Namespace::from([0x01; 32]);
        let mut acl = AccessList::new();
        acl.update_runtime(runtime, &[bad_node, good_node]);

        assert_eq!(acl.runtime_peers(&runtime), Some(&vec![good_peer]));
        check_mirrored(&acl);
    }
}
