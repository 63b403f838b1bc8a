//! Scheduler committees.
use crate::{beacon::EpochTime, crypto::signature::PublicKey, namespace::Namespace};

/// Kind of a committee.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
#[repr(u8)]
pub enum CommitteeKind {
    /// Invalid committee kind.
    #[default]
    Invalid = 0,
    /// Compute executor committee.
    ComputeExecutor = 1,
}

/// A committee member.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct CommitteeNode {
    /// Node identifier.
    pub public_key: PublicKey,
}

/// A per-runtime committee elected by the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq, cbor::Encode, cbor::Decode)]
pub struct Committee {
    /// Committee kind.
    pub kind: CommitteeKind,
    /// Committee members.
    pub members: Vec<CommitteeNode>,
    /// Runtime the committee is elected for.
    pub runtime_id: Namespace,
    /// Epoch the committee is valid for.
    pub valid_for: EpochTime,
}
