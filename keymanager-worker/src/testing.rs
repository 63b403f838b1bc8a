//! Mock backends for worker tests.
use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use keymanager_api::{
    beacon::EpochTime,
    crypto::{hash::Hash, signature::PublicKey, x25519},
    insecure,
    namespace::Namespace,
    registry::{CapabilityTEE, Node, Runtime, Version},
    scheduler::Committee,
    secrets::{EncryptedEphemeralSecret, EncryptedSecret, SignedEncryptedEphemeralSecret},
    types::{
        GenerateEphemeralSecretRequest, GenerateEphemeralSecretResponse, InitRequest,
        InitResponse, LoadEphemeralSecretRequest, SignedInitResponse, Status,
        METHOD_GENERATE_EPHEMERAL_SECRET, METHOD_INIT, METHOD_LOAD_EPHEMERAL_SECRET,
    },
    KeyManagerError,
};

use crate::{
    backend::{
        Beacon, Consensus, KeyManagerBackend, Registration, RegistrationInfo, Registry,
        Scheduler, Transaction,
    },
    enclave_rpc::{Body, Kind, Request, Response},
    host::{EnclaveHost, HostEvent},
};

/// Capacity of mock event channels.
const CHANNEL_CAPACITY: usize = 64;

fn broadcast<T: Clone>(subs: &Mutex<Vec<mpsc::Sender<T>>>, value: T) {
    for sub in subs.lock().unwrap().iter() {
        let _ = sub.try_send(value.clone());
    }
}

fn subscribe<T>(subs: &Mutex<Vec<mpsc::Sender<T>>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    subs.lock().unwrap().push(tx);
    rx
}

/// Mock consensus key manager backend.
#[derive(Default)]
pub struct MockKeyManagerBackend {
    statuses: Mutex<HashMap<Namespace, Status>>,
    secrets: Mutex<HashMap<(Namespace, EpochTime), SignedEncryptedEphemeralSecret>>,
    secret_queries: Mutex<Vec<(Namespace, EpochTime)>>,
    status_subs: Mutex<Vec<mpsc::Sender<Status>>>,
    secret_subs: Mutex<Vec<mpsc::Sender<SignedEncryptedEphemeralSecret>>>,
}

impl MockKeyManagerBackend {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record a new status and notify watchers.
    pub fn publish_status(&self, status: Status) {
        self.statuses.lock().unwrap().insert(status.id, status.clone());
        broadcast(&self.status_subs, status);
    }

    /// Record a published secret without notifying watchers.
    pub fn insert_secret(&self, secret: SignedEncryptedEphemeralSecret) {
        self.secrets
            .lock()
            .unwrap()
            .insert((secret.secret.runtime_id, secret.secret.epoch), secret);
    }

    /// Record a published secret and notify watchers.
    pub fn publish_secret(&self, secret: SignedEncryptedEphemeralSecret) {
        self.insert_secret(secret.clone());
        broadcast(&self.secret_subs, secret);
    }

    /// Ephemeral secret queries observed so far.
    pub fn secret_queries(&self) -> Vec<(Namespace, EpochTime)> {
        self.secret_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyManagerBackend for MockKeyManagerBackend {
    async fn get_status(&self, runtime_id: Namespace) -> Result<Status, KeyManagerError> {
        self.statuses
            .lock()
            .unwrap()
            .get(&runtime_id)
            .cloned()
            .ok_or(KeyManagerError::NoSuchStatus)
    }

    async fn get_ephemeral_secret(
        &self,
        runtime_id: Namespace,
        epoch: EpochTime,
    ) -> Result<SignedEncryptedEphemeralSecret, KeyManagerError> {
        self.secret_queries.lock().unwrap().push((runtime_id, epoch));
        self.secrets
            .lock()
            .unwrap()
            .get(&(runtime_id, epoch))
            .cloned()
            .ok_or(KeyManagerError::NoSuchEphemeralSecret)
    }

    fn watch_statuses(&self) -> mpsc::Receiver<Status> {
        subscribe(&self.status_subs)
    }

    fn watch_ephemeral_secrets(&self) -> mpsc::Receiver<SignedEncryptedEphemeralSecret> {
        subscribe(&self.secret_subs)
    }
}

/// Mock consensus block and transaction services.
#[derive(Default)]
pub struct MockConsensus {
    submitted: Mutex<Vec<Transaction>>,
    block_subs: Mutex<Vec<mpsc::Sender<u64>>>,
}

impl MockConsensus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Notify watchers of a new block height.
    pub fn advance_block(&self, height: u64) {
        broadcast(&self.block_subs, height);
    }

    /// Transactions submitted so far.
    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Consensus for MockConsensus {
    fn watch_blocks(&self) -> mpsc::Receiver<u64> {
        subscribe(&self.block_subs)
    }

    async fn submit_tx(&self, tx: Transaction) -> Result<(), KeyManagerError> {
        self.submitted.lock().unwrap().push(tx);
        Ok(())
    }
}

/// Mock node and runtime registry.
#[derive(Default)]
pub struct MockRegistry {
    runtimes: Mutex<Vec<Runtime>>,
    nodes: Mutex<HashMap<PublicKey, Node>>,
    runtime_subs: Mutex<Vec<mpsc::Sender<Runtime>>>,
    node_subs: Mutex<Vec<mpsc::Sender<Node>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record a runtime without notifying watchers.
    pub fn insert_runtime(&self, runtime: Runtime) {
        self.runtimes.lock().unwrap().push(runtime);
    }

    /// Record a runtime and notify watchers.
    pub fn publish_runtime(&self, runtime: Runtime) {
        self.insert_runtime(runtime.clone());
        broadcast(&self.runtime_subs, runtime);
    }

    /// Record a node descriptor without notifying watchers.
    pub fn insert_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.id, node);
    }

    /// Record a node descriptor and notify watchers.
    pub fn publish_node(&self, node: Node) {
        self.insert_node(node.clone());
        broadcast(&self.node_subs, node);
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get_runtimes(&self) -> Result<Vec<Runtime>, KeyManagerError> {
        Ok(self.runtimes.lock().unwrap().clone())
    }

    async fn get_node(&self, id: PublicKey) -> Result<Node, KeyManagerError> {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| KeyManagerError::Other(anyhow::anyhow!("node not found")))
    }

    fn watch_runtimes(&self) -> mpsc::Receiver<Runtime> {
        subscribe(&self.runtime_subs)
    }

    fn watch_nodes(&self) -> mpsc::Receiver<Node> {
        subscribe(&self.node_subs)
    }
}

/// Mock scheduler.
#[derive(Default)]
pub struct MockScheduler {
    committees: Mutex<HashMap<Namespace, Vec<Committee>>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record an elected committee.
    pub fn insert_committee(&self, committee: Committee) {
        self.committees
            .lock()
            .unwrap()
            .entry(committee.runtime_id)
            .or_default()
            .push(committee);
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn get_committees(
        &self,
        runtime_id: Namespace,
    ) -> Result<Vec<Committee>, KeyManagerError> {
        Ok(self
            .committees
            .lock()
            .unwrap()
            .get(&runtime_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Mock beacon with a fixed epoch interval. The first block of epoch `e` is
/// at height `100 * e`.
pub struct MockBeacon {
    epoch: Mutex<EpochTime>,
    interval: u64,
    epoch_subs: Mutex<Vec<mpsc::Sender<EpochTime>>>,
}

impl MockBeacon {
    pub fn new(interval: u64) -> Self {
        Self {
            epoch: Mutex::new(0),
            interval,
            epoch_subs: Mutex::new(vec![]),
        }
    }

    /// Height of the first block of an epoch.
    pub fn first_block(epoch: EpochTime) -> u64 {
        epoch * 100
    }

    /// Set the current epoch without notifying watchers.
    pub fn set_epoch(&self, epoch: EpochTime) {
        *self.epoch.lock().unwrap() = epoch;
    }

    /// Set the current epoch and notify watchers.
    pub fn publish_epoch(&self, epoch: EpochTime) {
        self.set_epoch(epoch);
        broadcast(&self.epoch_subs, epoch);
    }
}

#[async_trait]
impl Beacon for MockBeacon {
    async fn get_epoch(&self) -> Result<EpochTime, KeyManagerError> {
        Ok(*self.epoch.lock().unwrap())
    }

    async fn get_epoch_block(&self, epoch: EpochTime) -> Result<u64, KeyManagerError> {
        Ok(Self::first_block(epoch))
    }

    async fn epoch_interval(&self) -> Result<u64, KeyManagerError> {
        Ok(self.interval)
    }

    fn watch_epochs(&self) -> mpsc::Receiver<EpochTime> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let epoch = *self.epoch.lock().unwrap();
        // Replay the current epoch to new watchers.
        if epoch > 0 {
            let _ = tx.try_send(epoch);
        }
        self.epoch_subs.lock().unwrap().push(tx);
        rx
    }
}

/// Mock node registration service.
#[derive(Default)]
pub struct MockRegistration {
    registrations: Mutex<Vec<RegistrationInfo>>,
}

impl MockRegistration {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registrations recorded so far.
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.registrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Registration for MockRegistration {
    async fn register(&self, info: RegistrationInfo) -> Result<(), KeyManagerError> {
        self.registrations.lock().unwrap().push(info);
        Ok(())
    }
}

/// Mock runtime host with a built-in mock key manager enclave.
///
/// The mock enclave signs its responses with the insecure RAK and encrypts
/// generated secrets to a configurable REK set.
pub struct MockEnclaveHost {
    runtime_id: Namespace,
    reks: Mutex<Vec<x25519::PublicKey>>,
    fail_loads: Mutex<bool>,
    response: Mutex<Option<Vec<u8>>>,

    init_requests: Mutex<Vec<InitRequest>>,
    generate_requests: Mutex<Vec<GenerateEphemeralSecretRequest>>,
    loaded: Mutex<Vec<SignedEncryptedEphemeralSecret>>,
    load_attempts: Mutex<u64>,
    session_calls: Mutex<Vec<Vec<u8>>>,
    event_subs: Mutex<Vec<mpsc::Sender<HostEvent>>>,
}

impl MockEnclaveHost {
    pub fn new(runtime_id: Namespace) -> Self {
        Self {
            runtime_id,
            reks: Mutex::new(vec![insecure::insecure_rek()]),
            fail_loads: Mutex::new(false),
            response: Mutex::new(None),
            init_requests: Mutex::new(vec![]),
            generate_requests: Mutex::new(vec![]),
            loaded: Mutex::new(vec![]),
            load_attempts: Mutex::new(0),
            session_calls: Mutex::new(vec![]),
            event_subs: Mutex::new(vec![]),
        }
    }

    /// Set the REKs generated secrets are encrypted to.
    pub fn set_reks(&self, reks: Vec<x25519::PublicKey>) {
        *self.reks.lock().unwrap() = reks;
    }

    /// Make all `load_ephemeral_secret` calls fail.
    pub fn set_fail_loads(&self, fail: bool) {
        *self.fail_loads.lock().unwrap() = fail;
    }

    /// Override all local responses with a canned envelope.
    pub fn set_response(&self, response: Response) {
        *self.response.lock().unwrap() = Some(cbor::to_vec(response));
    }

    /// Override all local responses with raw bytes.
    pub fn set_raw_response(&self, raw: Vec<u8>) {
        *self.response.lock().unwrap() = Some(raw);
    }

    /// Emit a host event to all watchers.
    pub fn emit_event(&self, event: HostEvent) {
        broadcast(&self.event_subs, event);
    }

    /// Emit a `Started` host event.
    pub fn emit_started(&self, version: Version, capability_tee: Option<CapabilityTEE>) {
        self.emit_event(HostEvent::Started {
            version,
            capability_tee,
        });
    }

    /// Build a signed secret the way the mock enclave would.
    pub fn make_signed_secret(&self, epoch: EpochTime) -> SignedEncryptedEphemeralSecret {
        let secret = EncryptedEphemeralSecret {
            runtime_id: self.runtime_id,
            epoch,
            secret: EncryptedSecret {
                checksum: vec![0x42; 32],
                pub_key: x25519::PrivateKey::from([0x11; 32]).public_key(),
                nonce: vec![0x33; 15],
                ciphertexts: self
                    .reks
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|rek| (*rek, vec![0x44; 48]))
                    .collect(),
            },
        };
        SignedEncryptedEphemeralSecret::new(secret, insecure::insecure_rak_signer())
            .expect("mock secret signing")
    }

    /// Init requests recorded so far.
    pub fn init_requests(&self) -> Vec<InitRequest> {
        self.init_requests.lock().unwrap().clone()
    }

    /// Generation requests recorded so far.
    pub fn generate_requests(&self) -> Vec<GenerateEphemeralSecretRequest> {
        self.generate_requests.lock().unwrap().clone()
    }

    /// Secrets successfully loaded so far.
    pub fn loaded(&self) -> Vec<SignedEncryptedEphemeralSecret> {
        self.loaded.lock().unwrap().clone()
    }

    /// Number of load attempts, including failed ones.
    pub fn load_attempts(&self) -> u64 {
        *self.load_attempts.lock().unwrap()
    }

    /// Session and insecure query payloads recorded so far.
    pub fn session_calls(&self) -> Vec<Vec<u8>> {
        self.session_calls.lock().unwrap().clone()
    }

    fn handle_local(&self, request: Vec<u8>) -> Result<Vec<u8>, KeyManagerError> {
        if let Some(raw) = self.response.lock().unwrap().clone() {
            return Ok(raw);
        }

        let request: Request =
            cbor::from_slice(&request).map_err(|_| KeyManagerError::InvalidArgument)?;
        let body = match request.method.as_str() {
            METHOD_INIT => {
                let args: InitRequest = cbor::from_value(request.args)
                    .map_err(|_| KeyManagerError::InvalidArgument)?;
                self.init_requests.lock().unwrap().push(args.clone());

                let response = InitResponse {
                    is_secure: false,
                    checksum: args.checksum,
                    policy_checksum: Hash::digest_bytes(&args.policy).as_bytes().to_vec(),
                    rsk: None,
                };
                let signed =
                    SignedInitResponse::new(response, insecure::insecure_rak_signer())?;
                Body::Success(cbor::to_value(signed))
            }
            METHOD_GENERATE_EPHEMERAL_SECRET => {
                let args: GenerateEphemeralSecretRequest = cbor::from_value(request.args)
                    .map_err(|_| KeyManagerError::InvalidArgument)?;
                self.generate_requests.lock().unwrap().push(args.clone());

                Body::Success(cbor::to_value(GenerateEphemeralSecretResponse {
                    signed_secret: self.make_signed_secret(args.epoch),
                }))
            }
            METHOD_LOAD_EPHEMERAL_SECRET => {
                *self.load_attempts.lock().unwrap() += 1;
                if *self.fail_loads.lock().unwrap() {
                    Body::Error("load failed".to_owned())
                } else {
                    let args: LoadEphemeralSecretRequest = cbor::from_value(request.args)
                        .map_err(|_| KeyManagerError::InvalidArgument)?;
                    self.loaded.lock().unwrap().push(args.signed_secret);
                    Body::Success(cbor::Value::Simple(cbor::SimpleValue::NullValue))
                }
            }
            _ => Body::Error(format!("unknown method: {}", request.method)),
        };

        Ok(cbor::to_vec(Response { body }))
    }
}

#[async_trait]
impl EnclaveHost for MockEnclaveHost {
    async fn provision(&self) -> Result<Version, KeyManagerError> {
        Ok(Version::new(1, 0, 0))
    }

    async fn start(&self) -> Result<(), KeyManagerError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn watch_events(&self) -> mpsc::Receiver<HostEvent> {
        subscribe(&self.event_subs)
    }

    async fn call(&self, kind: Kind, request: Vec<u8>) -> Result<Vec<u8>, KeyManagerError> {
        match kind {
            Kind::LocalQuery => self.handle_local(request),
            Kind::NoiseSession | Kind::InsecureQuery => {
                self.session_calls.lock().unwrap().push(request);
                Ok(b"mock enclave response".to_vec())
            }
        }
    }
}
