//! Key manager worker.
//!
//! The worker drives the hosted key manager enclave and keeps it in step
//! with the consensus layer. It reacts to key manager status updates by
//! (re)initializing the enclave and registering the node, participates in
//! the committee-wide publication of per-epoch ephemeral secrets, replicates
//! observed secrets into the enclave, and maintains the per-runtime access
//! control list that gates remote enclave calls.
//!
//! All mutable state is owned by a single event-dispatch loop; satellite
//! tasks communicate with it exclusively through channels.

pub mod access;
mod attestation;
pub mod backend;
pub mod config;
pub mod enclave_rpc;
pub mod host;
mod logger;
mod secrets;
mod watcher;
mod worker;

#[cfg(any(test, feature = "test"))]
pub mod testing;

pub use access::PeerId;
pub use config::Config;
pub use worker::{Backends, Worker, WorkerStatus};
