//! Key manager access control policy.
use std::collections::BTreeMap;

use crate::{
    crypto::{hash::Hash, signature::SignatureBundle},
    namespace::Namespace,
};

/// An enclave identity.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, cbor::Encode, cbor::Decode,
)]
pub struct EnclaveIdentity {
    /// Enclave measurement.
    pub mr_enclave: Hash,
    /// Enclave signer measurement.
    pub mr_signer: Hash,
}

/// Per-enclave key manager access control policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct EnclavePolicy {
    /// A map of runtimes to the vector of enclave identities that may query
    /// private key material on their behalf.
    pub may_query: BTreeMap<Namespace, Vec<EnclaveIdentity>>,
    /// A vector of enclave identities that may retrieve the master secret.
    pub may_replicate: Vec<EnclaveIdentity>,
}

/// A key manager access control policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct Policy {
    /// Monotonically increasing policy serial number.
    pub serial: u32,
    /// Identifier of the key manager runtime the policy is valid for.
    pub id: Namespace,
    /// Per-enclave policies.
    pub enclaves: BTreeMap<EnclaveIdentity, EnclavePolicy>,
}

impl Policy {
    /// Whether any enclave policy permits the given runtime to query keys.
    pub fn may_query(&self, runtime_id: &Namespace) -> bool {
        self.enclaves
            .values()
            .any(|ep| ep.may_query.contains_key(runtime_id))
    }
}

/// A signed key manager access control policy.
///
/// The worker treats the signatures as opaque; they are verified by the
/// enclave against its trusted policy signers.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct SignedPolicy {
    /// The policy document.
    pub policy: Policy,
    /// Signatures over the policy document.
    pub signatures: Vec<SignatureBundle>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_may_query() {
        let permitted = Namespace::from([0xaa; 32]);
        let other = Namespace::from([0xbb; 32]);

        let mut policy = Policy::default();
        assert!(!policy.may_query(&permitted));

        policy.enclaves.insert(
            EnclaveIdentity::default(),
            EnclavePolicy {
                may_query: BTreeMap::from([(permitted, vec![])]),
                may_replicate: vec![],
            },
        );
        assert!(policy.may_query(&permitted));
        assert!(!policy.may_query(&other));
    }
}
