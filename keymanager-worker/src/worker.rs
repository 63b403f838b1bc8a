//! The key manager worker and its event-dispatch loop.
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
};

use anyhow::anyhow;
use backoff::backoff::Backoff;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use keymanager_api::{
    beacon::EpochTime,
    namespace::Namespace,
    policy::SignedPolicy,
    registry::{Node, Runtime, RuntimeKind, Version},
    secrets::SignedEncryptedEphemeralSecret,
    types::{
        InitRequest, InitResponse, LoadEphemeralSecretRequest, SignedInitResponse, Status,
        METHOD_INIT, METHOD_LOAD_EPHEMERAL_SECRET,
    },
    KeyManagerError,
};

use crate::{
    access::{AccessList, PeerId},
    attestation,
    backend::{
        Beacon, Consensus, KeyManagerBackend, Registration, RegistrationInfo, Registry, Scheduler,
    },
    config::Config,
    enclave_rpc::{EnclaveClient, Kind},
    host::{EnclaveHost, HostEvent, RuntimeStatus},
    logger::get_logger,
    secrets::{self, GenerateOutcome, GenerateTask, GenerationState},
    watcher::ClientRuntimeWatcher,
};

/// Capacity of the command channel satellite tasks push into the loop.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Commands pushed into the worker loop by satellite tasks. The loop is the
/// sole mutator of worker state; everyone else goes through here.
#[derive(Debug)]
pub(crate) enum Command {
    /// Replace the access list entries of a runtime.
    SetAccessList {
        runtime_id: Namespace,
        nodes: Vec<Node>,
    },
}

/// Worker state shared with RPC handlers and introspection.
pub(crate) struct SharedState {
    /// Access control table for remote peers.
    pub access_list: AccessList,
    /// Verified enclave initialization status.
    pub enclave_status: Option<InitResponse>,
    /// Current key manager policy.
    pub policy: Option<SignedPolicy>,
    /// Checksum of the current policy.
    pub policy_checksum: Vec<u8>,
    /// Number of client runtimes with an active committee watcher.
    pub compute_runtime_count: u64,
    /// Height at which the next ephemeral secret generation is scheduled,
    /// when armed.
    pub generation_height: Option<u64>,
    /// Epoch of the last locally generated ephemeral secret.
    pub last_generated_epoch: Option<EpochTime>,
    /// Epoch of the last ephemeral secret loaded into the enclave.
    pub last_loaded_epoch: Option<EpochTime>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            access_list: AccessList::new(),
            enclave_status: None,
            policy: None,
            policy_checksum: vec![],
            compute_runtime_count: 0,
            generation_height: None,
            last_generated_epoch: None,
            last_loaded_epoch: None,
        }
    }
}

pub(crate) type Shared = Arc<RwLock<SharedState>>;

/// A point-in-time snapshot of the worker state.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    /// Whether the enclave has been successfully initialized.
    pub initialized: bool,
    /// Whether the enclave runs in secure mode.
    pub is_secure: bool,
    /// Checksum of the key manager master secret.
    pub checksum: Vec<u8>,
    /// Checksum of the policy the enclave runs under.
    pub policy_checksum: Vec<u8>,
    /// Number of client runtimes with an active committee watcher.
    pub compute_runtime_count: u64,
    /// Height at which the next ephemeral secret generation is scheduled,
    /// when armed.
    pub generation_height: Option<u64>,
    /// Epoch of the last locally generated ephemeral secret.
    pub last_generated_epoch: Option<EpochTime>,
    /// Epoch of the last ephemeral secret loaded into the enclave.
    pub last_loaded_epoch: Option<EpochTime>,
}

/// External backends the worker is wired to.
#[derive(Clone)]
pub struct Backends {
    pub keymanager: Arc<dyn KeyManagerBackend>,
    pub consensus: Arc<dyn Consensus>,
    pub registry: Arc<dyn Registry>,
    pub scheduler: Arc<dyn Scheduler>,
    pub beacon: Arc<dyn Beacon>,
    pub registration: Arc<dyn Registration>,
    pub host: Arc<dyn EnclaveHost>,
}

/// Key manager worker.
///
/// Created stopped; `start` launches the event loop which runs until `stop`.
pub struct Worker {
    shared: Shared,
    enclave: Arc<EnclaveClient>,
    initialized: watch::Receiver<bool>,
    quit: watch::Receiver<bool>,
    stopper: CancellationToken,
    processor: Mutex<Option<Processor>>,
}

impl Worker {
    /// Create a new key manager worker.
    pub fn new(cfg: Config, backends: Backends) -> Self {
        let shared: Shared = Arc::new(RwLock::new(SharedState::new()));
        let stopper = CancellationToken::new();
        let enclave = Arc::new(EnclaveClient::new(
            backends.host.clone(),
            shared.clone(),
            cfg.private_peers.iter().copied().collect(),
            stopper.clone(),
        ));

        let (initialized_tx, initialized_rx) = watch::channel(false);
        let (quit_tx, quit_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (gen_done_tx, gen_done_rx) = mpsc::channel(1);
        let (load_tx, load_rx) = mpsc::channel(1);

        let processor = Processor {
            cfg,
            backends,
            shared: shared.clone(),
            enclave: enclave.clone(),
            stopper: stopper.clone(),
            initialized: initialized_tx,
            quit: quit_tx,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            gen_done_tx,
            gen_done_rx: Some(gen_done_rx),
            load_tx,
            load_rx: Some(load_rx),
            status: None,
            runtime_status: None,
            provisioned_version: None,
            current_epoch: 0,
            generation: GenerationState::new(),
            gen_epoch: 0,
            gen_task: None,
            pending_secrets: VecDeque::new(),
            load_retries: 0,
            watched_runtimes: HashSet::new(),
            init_backoff: None,
            init_retry_deadline: None,
            logger: get_logger("worker/keymanager"),
        };

        Self {
            shared,
            enclave,
            initialized: initialized_rx,
            quit: quit_rx,
            stopper,
            processor: Mutex::new(Some(processor)),
        }
    }

    /// Start the worker loop.
    pub fn start(&self) {
        if let Some(processor) = self.processor.lock().unwrap().take() {
            tokio::spawn(processor.run());
        }
    }

    /// Request the worker to stop.
    pub fn stop(&self) {
        self.stopper.cancel();
    }

    /// Wait for the worker loop to terminate.
    pub async fn wait_quit(&self) {
        let mut quit = self.quit.clone();
        while !*quit.borrow_and_update() {
            if quit.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the enclave to be initialized for the first time.
    pub async fn wait_initialized(&self) {
        let mut initialized = self.initialized.clone();
        while !*initialized.borrow_and_update() {
            if initialized.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the enclave has been initialized.
    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Handle an enclave call from the RPC layer on behalf of a remote peer.
    ///
    /// Local queries are always refused.
    pub async fn call_enclave(
        &self,
        peer: &PeerId,
        kind: Kind,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, KeyManagerError> {
        match kind {
            Kind::NoiseSession => self.enclave.call_session(peer, data).await,
            Kind::InsecureQuery => self.enclave.call_insecure(data).await,
            Kind::LocalQuery => Err(KeyManagerError::UnsupportedRpcKind),
        }
    }

    /// Snapshot of the current worker state.
    pub fn status(&self) -> WorkerStatus {
        let shared = self.shared.read().unwrap();
        WorkerStatus {
            initialized: *self.initialized.borrow(),
            is_secure: shared
                .enclave_status
                .as_ref()
                .map(|s| s.is_secure)
                .unwrap_or_default(),
            checksum: shared
                .enclave_status
                .as_ref()
                .map(|s| s.checksum.clone())
                .unwrap_or_default(),
            policy_checksum: shared.policy_checksum.clone(),
            compute_runtime_count: shared.compute_runtime_count,
            generation_height: shared.generation_height,
            last_generated_epoch: shared.last_generated_epoch,
            last_loaded_epoch: shared.last_loaded_epoch,
        }
    }
}

/// The single-writer event loop owning all mutable worker state.
struct Processor {
    cfg: Config,
    backends: Backends,
    shared: Shared,
    enclave: Arc<EnclaveClient>,
    stopper: CancellationToken,

    initialized: watch::Sender<bool>,
    quit: watch::Sender<bool>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    gen_done_tx: mpsc::Sender<GenerateOutcome>,
    gen_done_rx: Option<mpsc::Receiver<GenerateOutcome>>,
    load_tx: mpsc::Sender<()>,
    load_rx: Option<mpsc::Receiver<()>>,

    /// Last observed key manager status.
    status: Option<Status>,
    /// Status of the hosted enclave; `None` when it is not running.
    runtime_status: Option<RuntimeStatus>,
    /// Version provisioned from the bundle.
    provisioned_version: Option<Version>,
    current_epoch: EpochTime,
    /// Ephemeral secret generation schedule.
    generation: GenerationState,
    /// Epoch the armed or in-flight generation targets.
    gen_epoch: EpochTime,
    gen_task: Option<JoinHandle<()>>,
    /// Secrets observed on-chain but not yet loaded into the enclave.
    pending_secrets: VecDeque<SignedEncryptedEphemeralSecret>,
    load_retries: u32,
    /// Client runtimes with a started committee watcher.
    watched_runtimes: HashSet<Namespace>,
    init_backoff: Option<backoff::ExponentialBackoff>,
    init_retry_deadline: Option<time::Instant>,

    logger: slog::Logger,
}

impl Processor {
    async fn run(mut self) {
        slog::info!(self.logger, "starting key manager worker");

        // Subscribe to all event sources up front so nothing is lost while
        // the enclave is being provisioned.
        let mut host_events = self.backends.host.watch_events();
        let mut statuses = self.backends.keymanager.watch_statuses();
        let mut secret_feed = self.backends.keymanager.watch_ephemeral_secrets();
        let mut epochs = self.backends.beacon.watch_epochs();
        let mut blocks = self.backends.consensus.watch_blocks();
        let mut runtimes = self.backends.registry.watch_runtimes();

        let Some(mut cmd_rx) = self.cmd_rx.take() else {
            return;
        };
        let Some(mut gen_done_rx) = self.gen_done_rx.take() else {
            return;
        };
        let Some(mut load_rx) = self.load_rx.take() else {
            return;
        };

        // The current epoch is needed for scheduling and enclave warm-up.
        match self.backends.beacon.get_epoch().await {
            Ok(epoch) => self.current_epoch = epoch,
            Err(err) => {
                slog::warn!(self.logger, "failed to query current epoch"; "err" => %err)
            }
        }
        self.gen_epoch = self.current_epoch + 1;

        // Pick up a status recorded before the subscription; later updates
        // arrive through the watch stream.
        match self
            .backends
            .keymanager
            .get_status(self.cfg.runtime_id)
            .await
        {
            Ok(status) => self.handle_status_update(status).await,
            Err(KeyManagerError::NoSuchStatus) => (),
            Err(err) => {
                slog::warn!(self.logger, "failed to query key manager status"; "err" => %err)
            }
        }

        let stopper = self.stopper.clone();

        loop {
            tokio::select! {
                maybe_event = host_events.recv() => match maybe_event {
                    Some(event) => self.handle_host_event(event).await,
                    None => {
                        slog::error!(self.logger, "runtime host event stream closed");
                        break;
                    }
                },

                maybe_status = statuses.recv() => match maybe_status {
                    Some(status) => self.handle_status_update(status).await,
                    None => {
                        slog::error!(self.logger, "status stream closed");
                        break;
                    }
                },

                maybe_secret = secret_feed.recv() => match maybe_secret {
                    Some(secret) => self.handle_secret(secret),
                    None => {
                        slog::error!(self.logger, "ephemeral secret stream closed");
                        break;
                    }
                },

                maybe_epoch = epochs.recv() => match maybe_epoch {
                    Some(epoch) => self.handle_epoch(epoch).await,
                    None => {
                        slog::error!(self.logger, "epoch stream closed");
                        break;
                    }
                },

                maybe_height = blocks.recv() => match maybe_height {
                    Some(height) => self.handle_block(height),
                    None => {
                        slog::error!(self.logger, "block stream closed");
                        break;
                    }
                },

                Some(runtime) = runtimes.recv() => self.handle_runtime(runtime),

                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd),

                Some(outcome) = gen_done_rx.recv() => self.handle_generate_done(outcome),

                Some(()) = load_rx.recv() => self.load_pending_secrets().await,

                _ = time::sleep_until(self.init_retry_deadline.unwrap_or_else(time::Instant::now)),
                    if self.init_retry_deadline.is_some() =>
                {
                    self.init_retry_deadline = None;
                    self.retry_init().await;
                }

                _ = stopper.cancelled() => break,
            }
        }

        // Cancel satellite tasks and wait for an outstanding generation
        // attempt; the task itself honors cancellation through the enclave
        // client.
        self.stopper.cancel();
        if let Some(task) = self.gen_task.take() {
            let _ = task.await;
        }

        let _ = self.quit.send(true);
        slog::info!(self.logger, "key manager worker stopped");
    }

    async fn handle_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Started {
                version,
                capability_tee,
            } => {
                slog::info!(self.logger, "key manager enclave started"; "version" => %version);
                self.runtime_status = Some(RuntimeStatus {
                    version,
                    capability_tee,
                });

                // Bring the freshly started enclave up to date with recently
                // published secrets.
                self.fetch_recent_secrets().await;

                // Initialization is likely to have failed while the enclave
                // was down, so re-run it now.
                if let Some(status) = self.status.clone() {
                    self.apply_status(status).await;
                }
            }
            HostEvent::Updated { capability_tee } => {
                if let Some(runtime_status) = &mut self.runtime_status {
                    runtime_status.capability_tee = capability_tee;
                }
                if let Some(status) = self.status.clone() {
                    self.apply_status(status).await;
                }
            }
            HostEvent::Stopped => {
                slog::warn!(self.logger, "key manager enclave stopped");
                self.runtime_status = None;
            }
            HostEvent::FailedToStart => {
                slog::error!(self.logger, "key manager enclave failed to start");
                self.runtime_status = None;
            }
        }
    }

    async fn handle_status_update(&mut self, status: Status) {
        if status.id != self.cfg.runtime_id {
            return;
        }
        if let Err(err) = status.validate_basic() {
            slog::warn!(self.logger, "discarding malformed key manager status"; "err" => %err);
            return;
        }

        slog::info!(self.logger, "key manager status updated";
            "is_initialized" => status.is_initialized,
            "is_secure" => status.is_secure,
        );

        self.status = Some(status.clone());
        self.apply_status(status).await;
    }

    /// Apply a key manager status to the enclave, arming the retry timer with
    /// exponential backoff on failure.
    async fn apply_status(&mut self, status: Status) {
        match self.initialize_enclave(&status).await {
            Ok(()) => {
                self.init_backoff = None;
                self.init_retry_deadline = None;
            }
            Err(err) => {
                slog::warn!(self.logger, "failed to initialize enclave"; "err" => %err);
                let backoff = self.init_backoff.get_or_insert_with(|| {
                    backoff::ExponentialBackoff {
                        max_elapsed_time: None,
                        ..Default::default()
                    }
                });
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                self.init_retry_deadline = Some(time::Instant::now() + delay);
            }
        }
    }

    async fn retry_init(&mut self) {
        if let Some(status) = self.status.clone() {
            self.apply_status(status).await;
        }
    }

    /// Initialize the enclave against the given status, register the node and
    /// start watchers for authorized client runtimes.
    async fn initialize_enclave(&mut self, status: &Status) -> Result<(), KeyManagerError> {
        // Provision and start the enclave on first use.
        if self.provisioned_version.is_none() {
            let version = self.backends.host.provision().await?;
            slog::info!(self.logger, "provisioned key manager enclave"; "version" => %version);
            self.backends.host.start().await?;
            self.provisioned_version = Some(version);
        }
        let version = self.provisioned_version.unwrap_or_default();

        // The enclave must be running; a start is reported through the host
        // event stream, which re-runs initialization.
        let runtime_status = self
            .runtime_status
            .clone()
            .ok_or_else(|| KeyManagerError::Other(anyhow!("enclave not running")))?;

        // Initialize the enclave against the current consensus status.
        let request = InitRequest {
            checksum: status.checksum.clone(),
            policy: cbor::to_vec(status.policy.clone()),
            may_generate: self.cfg.may_generate,
        };
        let signed_response: SignedInitResponse =
            self.enclave.call_local(METHOD_INIT, request).await?;

        // Verify the response against the attested RAK.
        let rak = attestation::runtime_attestation_key(&runtime_status)?;
        let response = signed_response.verify(&rak)?;

        slog::info!(self.logger, "key manager enclave initialized";
            "is_secure" => response.is_secure,
            "policy_checksum" => hex::encode(&response.policy_checksum),
        );

        // Publish the verified state for RPC handlers.
        {
            let mut shared = self.shared.write().unwrap();
            shared.enclave_status = Some(response.clone());
            shared.policy = status.policy.clone();
            shared.policy_checksum = response.policy_checksum.clone();
        }

        // Advertise availability of the hosted runtime.
        self.backends
            .registration
            .register(RegistrationInfo {
                version,
                extra_info: cbor::to_vec(signed_response),
                capability_tee: runtime_status.capability_tee.clone(),
            })
            .await?;

        // Signal initialization exactly once.
        if !*self.initialized.borrow() {
            let _ = self.initialized.send(true);
        }

        // Start watchers for newly authorized client runtimes. Failures here
        // are transient; later status updates and registrations retry.
        if let Err(err) = self.recheck_all_runtimes(status).await {
            slog::warn!(self.logger, "failed to check client runtimes"; "err" => %err);
        }

        Ok(())
    }

    async fn recheck_all_runtimes(&mut self, status: &Status) -> Result<(), KeyManagerError> {
        let runtimes = self.backends.registry.get_runtimes().await?;
        for runtime in runtimes {
            self.maybe_watch_runtime(status, &runtime);
        }
        Ok(())
    }

    fn handle_runtime(&mut self, runtime: Runtime) {
        if let Some(status) = self.status.clone() {
            self.maybe_watch_runtime(&status, &runtime);
        }
    }

    /// Start a committee watcher for the runtime if it is an authorized
    /// client of this key manager.
    fn maybe_watch_runtime(&mut self, status: &Status, runtime: &Runtime) {
        if runtime.kind != RuntimeKind::Compute {
            return;
        }
        if runtime.key_manager != Some(self.cfg.runtime_id) {
            return;
        }
        if self.watched_runtimes.contains(&runtime.id) {
            return;
        }
        if !policy_permits_runtime(status, &runtime.id) {
            return;
        }

        slog::info!(self.logger, "starting client runtime watcher"; "runtime_id" => %runtime.id);
        ClientRuntimeWatcher::new(
            runtime.id,
            self.backends.scheduler.clone(),
            self.backends.registry.clone(),
            self.backends.beacon.clone(),
            self.cmd_tx.clone(),
            self.stopper.child_token(),
        )
        .start();
        self.watched_runtimes.insert(runtime.id);
        self.shared.write().unwrap().compute_runtime_count += 1;
    }

    async fn handle_epoch(&mut self, epoch: EpochTime) {
        self.current_epoch = epoch;
        self.gen_epoch = epoch + 1;

        // Schedule generation at a random height within the epoch; on failure
        // generate immediately.
        let height = match self.generation_window(epoch).await {
            Ok(height) => height,
            Err(err) => {
                slog::warn!(self.logger, "failed to schedule ephemeral secret generation";
                    "err" => %err,
                    "epoch" => epoch,
                );
                0
            }
        };
        self.generation.arm(height);

        // Skip the epoch entirely when the next secret is already published.
        match self
            .backends
            .keymanager
            .get_ephemeral_secret(self.cfg.runtime_id, self.gen_epoch)
            .await
        {
            Ok(_) => self.generation.disarm(),
            Err(KeyManagerError::NoSuchEphemeralSecret) => (),
            Err(err) => {
                slog::warn!(self.logger, "failed to query published ephemeral secret";
                    "err" => %err,
                )
            }
        }

        self.publish_generation_state();
    }

    async fn generation_window(&self, epoch: EpochTime) -> Result<u64, KeyManagerError> {
        let first = self.backends.beacon.get_epoch_block(epoch).await?;
        let interval = self.backends.beacon.epoch_interval().await?;
        Ok(secrets::generation_height(first, interval))
    }

    fn handle_block(&mut self, height: u64) {
        // Retry pending secret loads on new blocks.
        if !self.pending_secrets.is_empty() {
            let _ = self.load_tx.try_send(());
        }

        if !self.cfg.may_generate || !self.generation.is_due(height) {
            return;
        }
        let Some(status) = &self.status else { return };
        let Some(runtime_status) = &self.runtime_status else {
            return;
        };
        let rak = match attestation::runtime_attestation_key(runtime_status) {
            Ok(rak) => rak,
            Err(err) => {
                slog::warn!(self.logger, "cannot determine enclave RAK"; "err" => %err);
                return;
            }
        };

        // Run the attempt on a detached task; the loop only observes its
        // completion through the done channel.
        self.generation.in_progress = true;
        let task = GenerateTask {
            runtime_id: self.cfg.runtime_id,
            node_id: self.cfg.node_id,
            epoch: self.gen_epoch,
            nodes: status.nodes.clone(),
            rak,
            keymanager: self.backends.keymanager.clone(),
            registry: self.backends.registry.clone(),
            consensus: self.backends.consensus.clone(),
            enclave: self.enclave.clone(),
            logger: self.logger.clone(),
        };
        self.gen_task = Some(task.spawn(self.gen_done_tx.clone()));
    }

    fn handle_generate_done(&mut self, outcome: GenerateOutcome) {
        self.generation.in_progress = false;
        self.gen_task = None;
        match outcome {
            GenerateOutcome::Published => {
                self.shared.write().unwrap().last_generated_epoch = Some(self.gen_epoch);
                // A first-attempt success keeps the height armed so that
                // generation is naturally retried if the publish transaction
                // fails to land; observing the publication disarms it.
                if self.generation.retries > 0 {
                    self.generation.disarm();
                }
            }
            GenerateOutcome::NotInCommittee => {
                // Committee membership is fixed for the epoch, so retrying on
                // later blocks cannot succeed.
                self.generation.disarm();
            }
            GenerateOutcome::Failed => {
                self.generation.retries += 1;
                if self.generation.retries >= secrets::GENERATE_SECRET_RETRIES {
                    slog::warn!(self.logger, "giving up generating ephemeral secret";
                        "epoch" => self.gen_epoch,
                    );
                    self.generation.disarm();
                }
            }
        }
        self.publish_generation_state();
    }

    fn handle_secret(&mut self, secret: SignedEncryptedEphemeralSecret) {
        if secret.secret.runtime_id != self.cfg.runtime_id {
            return;
        }

        // Another committee member has published the next epoch's secret.
        if secret.secret.epoch == self.current_epoch + 1 {
            self.generation.disarm();
            self.publish_generation_state();
        }

        if self.pending_secrets.len() >= secrets::EPHEMERAL_SECRET_CACHE_SIZE {
            self.pending_secrets.pop_front();
        }
        self.pending_secrets.push_back(secret);
        self.load_retries = 0;
        let _ = self.load_tx.try_send(());
    }

    /// Replicate pending secrets into the enclave. Failed secrets are retried
    /// on subsequent blocks; the retry budget covers the queue as a whole,
    /// not individual secrets.
    async fn load_pending_secrets(&mut self) {
        if self.pending_secrets.is_empty() {
            return;
        }

        let mut failed = VecDeque::new();
        while let Some(secret) = self.pending_secrets.pop_front() {
            let epoch = secret.secret.epoch;
            let request = LoadEphemeralSecretRequest {
                signed_secret: secret.clone(),
            };
            let result: Result<cbor::Value, _> = self
                .enclave
                .call_local(METHOD_LOAD_EPHEMERAL_SECRET, request)
                .await;
            match result {
                Ok(_) => {
                    self.shared.write().unwrap().last_loaded_epoch = Some(epoch);
                }
                Err(err) => {
                    slog::warn!(self.logger, "failed to load ephemeral secret";
                        "err" => %err,
                        "epoch" => epoch,
                    );
                    failed.push_back(secret);
                }
            }
        }

        if failed.is_empty() {
            return;
        }

        self.load_retries += 1;
        if self.load_retries >= secrets::LOAD_SECRET_RETRIES {
            slog::warn!(self.logger, "dropping unloadable ephemeral secrets";
                "count" => failed.len(),
            );
            return;
        }
        self.pending_secrets = failed;
    }

    /// Fetch up to the cache size of most recently published secrets so a
    /// freshly started enclave can catch up.
    async fn fetch_recent_secrets(&mut self) {
        let mut recent = Vec::new();
        let mut epoch = self.current_epoch;
        for _ in 0..secrets::EPHEMERAL_SECRET_CACHE_SIZE {
            match self
                .backends
                .keymanager
                .get_ephemeral_secret(self.cfg.runtime_id, epoch)
                .await
            {
                Ok(secret) => recent.push(secret),
                Err(KeyManagerError::NoSuchEphemeralSecret) => break,
                Err(err) => {
                    slog::warn!(self.logger, "failed to fetch ephemeral secret";
                        "err" => %err,
                        "epoch" => epoch,
                    );
                    break;
                }
            }
            if epoch == 0 {
                break;
            }
            epoch -= 1;
        }

        if recent.is_empty() {
            return;
        }

        // Load oldest first so the enclave ends up at the newest epoch.
        self.pending_secrets.clear();
        self.pending_secrets.extend(recent.into_iter().rev());
        self.load_retries = 0;
        let _ = self.load_tx.try_send(());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetAccessList { runtime_id, nodes } => {
                let mut shared = self.shared.write().unwrap();
                shared.access_list.update_runtime(runtime_id, &nodes);
            }
        }
    }

    /// Mirror the generation schedule into the shared state for
    /// introspection.
    fn publish_generation_state(&self) {
        let mut shared = self.shared.write().unwrap();
        shared.generation_height = self
            .generation
            .is_armed()
            .then_some(self.generation.height);
    }
}

/// Whether the policy allows the runtime to query this key manager. An
/// insecure key manager without a policy allows everyone, which is only
/// useful in test deployments.
fn policy_permits_runtime(status: &Status, runtime_id: &Namespace) -> bool {
    match &status.policy {
        None => !status.is_secure,
        Some(signed) => signed.policy.may_query(runtime_id),
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, collections::HashSet, time::Duration};

    use keymanager_api::{
        crypto::signature::{MemorySigner, PublicKey, Signer},
        insecure,
        policy::{EnclaveIdentity, EnclavePolicy, Policy},
        registry::P2PInfo,
        scheduler::{Committee, CommitteeKind, CommitteeNode},
        types::GenerateEphemeralSecretRequest,
    };

    use super::*;
    use crate::{
        backend::METHOD_PUBLISH_EPHEMERAL_SECRET,
        enclave_rpc::Frame,
        testing::{
            MockBeacon, MockConsensus, MockEnclaveHost, MockKeyManagerBackend, MockRegistration,
            MockRegistry, MockScheduler,
        },
    };

    const RUNTIME_ID: [u8; 32] = [0x80; 32];

    struct Harness {
        worker: Worker,
        keymanager: Arc<MockKeyManagerBackend>,
        consensus: Arc<MockConsensus>,
        registry: Arc<MockRegistry>,
        scheduler: Arc<MockScheduler>,
        beacon: Arc<MockBeacon>,
        registration: Arc<MockRegistration>,
        host: Arc<MockEnclaveHost>,
        node_id: PublicKey,
    }

    async fn harness(may_generate: bool, epoch: EpochTime) -> Harness {
        let runtime_id = Namespace::from(RUNTIME_ID);
        let node_id = MemorySigner::from_test_seed("worker node identity").public_key();

        let keymanager = Arc::new(MockKeyManagerBackend::new());
        let consensus = Arc::new(MockConsensus::new());
        let registry = Arc::new(MockRegistry::new());
        let scheduler = Arc::new(MockScheduler::new());
        let beacon = Arc::new(MockBeacon::new(0));
        let registration = Arc::new(MockRegistration::new());
        let host = Arc::new(MockEnclaveHost::new(runtime_id));
        beacon.set_epoch(epoch);

        let cfg = Config::new(runtime_id, node_id, may_generate, &[]).unwrap();
        let worker = Worker::new(
            cfg,
            Backends {
                keymanager: keymanager.clone(),
                consensus: consensus.clone(),
                registry: registry.clone(),
                scheduler: scheduler.clone(),
                beacon: beacon.clone(),
                registration: registration.clone(),
                host: host.clone(),
            },
        );
        worker.start();

        // Give the loop a moment to subscribe to all event sources.
        time::sleep(Duration::from_millis(50)).await;

        Harness {
            worker,
            keymanager,
            consensus,
            registry,
            scheduler,
            beacon,
            registration,
            host,
            node_id,
        }
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not satisfied in time");
    }

    async fn wait_initialized(h: &Harness) {
        time::timeout(Duration::from_secs(5), h.worker.wait_initialized())
            .await
            .expect("worker initialized in time");
    }

    fn insecure_status(h: &Harness) -> Status {
        Status {
            id: Namespace::from(RUNTIME_ID),
            is_initialized: false,
            is_secure: false,
            checksum: vec![],
            nodes: vec![h.node_id],
            policy: None,
            rsk: None,
        }
    }

    fn committee_node(seed: &str) -> Node {
        Node {
            id: MemorySigner::from_test_seed(&format!("{seed} identity")).public_key(),
            p2p: P2PInfo {
                id: MemorySigner::from_test_seed(&format!("{seed} p2p")).public_key(),
            },
            tee: None,
        }
    }

    fn noise_frame(method: &str) -> Vec<u8> {
        cbor::to_vec(Frame {
            session: vec![1; 32],
            untrusted_plaintext: method.to_owned(),
            payload: vec![2; 64],
        })
    }

    #[tokio::test]
    async fn test_cold_start_insecure() {
        let h = harness(true, 0).await;

        h.host.emit_started(Version::new(1, 0, 0), None);
        h.keymanager.publish_status(insecure_status(&h));
        wait_initialized(&h).await;

        // Exactly one init call with an empty checksum, a null policy and
        // generation enabled.
        assert_eq!(
            h.host.init_requests(),
            vec![InitRequest {
                checksum: vec![],
                policy: cbor::to_vec(None::<SignedPolicy>),
                may_generate: true,
            }],
        );

        // The registered extra info is the signed init response and verifies
        // against the insecure RAK.
        let registrations = h.registration.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].version, Version::new(1, 0, 0));
        let signed: SignedInitResponse = cbor::from_slice(&registrations[0].extra_info).unwrap();
        signed.verify(&insecure::insecure_rak()).unwrap();

        let status = h.worker.status();
        assert!(status.initialized);
        assert!(!status.is_secure);
        assert!(!status.policy_checksum.is_empty());
    }

    #[tokio::test]
    async fn test_epoch_already_published() {
        let h = harness(true, 0).await;
        let runtime_id = Namespace::from(RUNTIME_ID);

        h.host.emit_started(Version::new(1, 0, 0), None);
        h.keymanager.publish_status(insecure_status(&h));
        wait_initialized(&h).await;

        // The next epoch's secret is already on chain.
        h.keymanager
            .insert_secret(h.host.make_signed_secret(101));
        h.beacon.publish_epoch(100);
        eventually(|| h.keymanager.secret_queries().contains(&(runtime_id, 101))).await;

        // Generation is disarmed and no blocks trigger it.
        eventually(|| h.worker.status().generation_height.is_none()).await;
        h.consensus.advance_block(MockBeacon::first_block(100));
        time::sleep(Duration::from_millis(200)).await;
        assert!(h.host.generate_requests().is_empty());
    }

    #[tokio::test]
    async fn test_generate_and_publish() {
        let h = harness(true, 0).await;

        // Register our own node so committee REKs can be gathered.
        h.registry.insert_node(Node {
            id: h.node_id,
            p2p: P2PInfo {
                id: MemorySigner::from_test_seed("worker node p2p").public_key(),
            },
            tee: None,
        });

        h.host.emit_started(Version::new(1, 0, 0), None);
        h.keymanager.publish_status(insecure_status(&h));
        wait_initialized(&h).await;

        // With a zero epoch interval the generation height is the first block
        // of the epoch.
        h.beacon.publish_epoch(100);
        let height = MockBeacon::first_block(100);
        eventually(|| h.worker.status().generation_height == Some(height)).await;

        h.consensus.advance_block(height);
        eventually(|| {
            h.host.generate_requests() == vec![GenerateEphemeralSecretRequest { epoch: 101 }]
        })
        .await;
        eventually(|| !h.consensus.submitted().is_empty()).await;

        // The published secret verifies against the committee REK set and the
        // insecure RAK.
        let submitted = h.consensus.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].method, METHOD_PUBLISH_EPHEMERAL_SECRET);
        let secret: SignedEncryptedEphemeralSecret =
            cbor::from_value(submitted[0].body.clone()).unwrap();
        secret
            .verify(
                101,
                &HashSet::from([insecure::insecure_rek()]),
                &insecure::insecure_rak(),
            )
            .unwrap();

        // Exactly one generation attempt was made.
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.host.generate_requests().len(), 1);

        // Observing the publication disarms generation and replicates the
        // secret into the enclave.
        h.keymanager.publish_secret(secret.clone());
        eventually(|| h.worker.status().generation_height.is_none()).await;
        eventually(|| h.host.loaded() == vec![secret.clone()]).await;
        assert_eq!(h.worker.status().last_loaded_epoch, Some(101));
    }

    #[tokio::test]
    async fn test_not_in_committee_abandons_epoch() {
        let h = harness(true, 0).await;

        h.host.emit_started(Version::new(1, 0, 0), None);

        // The committee for this epoch does not include this node.
        let mut status = insecure_status(&h);
        status.nodes =
            vec![MemorySigner::from_test_seed("another committee member").public_key()];
        h.keymanager.publish_status(status);
        wait_initialized(&h).await;

        h.beacon.publish_epoch(100);
        let height = MockBeacon::first_block(100);
        eventually(|| h.worker.status().generation_height == Some(height)).await;

        // The first attempt notices the node is not in the committee and
        // abandons the epoch without touching the enclave.
        h.consensus.advance_block(height);
        eventually(|| h.worker.status().generation_height.is_none()).await;

        // Later blocks do not retry.
        h.consensus.advance_block(height + 1);
        time::sleep(Duration::from_millis(200)).await;
        assert!(h.host.generate_requests().is_empty());
        assert!(h.consensus.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_policy_gates_client_runtimes() {
        let h = harness(false, 0).await;
        let runtime_id = Namespace::from(RUNTIME_ID);
        let permitted = Namespace::from([0xaa; 32]);
        let denied = Namespace::from([0xbb; 32]);

        h.registry.insert_runtime(Runtime {
            id: denied,
            kind: RuntimeKind::Compute,
            key_manager: Some(runtime_id),
        });

        h.host.emit_started(Version::new(1, 0, 0), None);

        // The policy permits queries only on behalf of one runtime.
        let policy = SignedPolicy {
            policy: Policy {
                serial: 1,
                id: runtime_id,
                enclaves: BTreeMap::from([(
                    EnclaveIdentity::default(),
                    EnclavePolicy {
                        may_query: BTreeMap::from([(permitted, vec![])]),
                        may_replicate: vec![],
                    },
                )]),
            },
            signatures: vec![],
        };
        let mut status = insecure_status(&h);
        status.policy = Some(policy);
        h.keymanager.publish_status(status);
        wait_initialized(&h).await;

        // The denied runtime got no watcher.
        assert_eq!(h.worker.status().compute_runtime_count, 0);

        // Registering a permitted runtime starts one.
        h.registry.publish_runtime(Runtime {
            id: permitted,
            kind: RuntimeKind::Compute,
            key_manager: Some(runtime_id),
        });
        eventually(|| h.worker.status().compute_runtime_count == 1).await;
    }

    #[tokio::test]
    async fn test_peer_access_control() {
        let h = harness(false, 0).await;
        let runtime_id = Namespace::from(RUNTIME_ID);
        let client_runtime = Namespace::from([0x11; 32]);

        let member = committee_node("committee member");
        let member_peer = PeerId::from_public_key(&member.p2p.id).unwrap();
        let stranger =
            PeerId::from_public_key(&MemorySigner::from_test_seed("stranger p2p").public_key())
                .unwrap();

        h.registry.insert_runtime(Runtime {
            id: client_runtime,
            kind: RuntimeKind::Compute,
            key_manager: Some(runtime_id),
        });
        h.registry.insert_node(member.clone());
        h.scheduler.insert_committee(Committee {
            kind: CommitteeKind::ComputeExecutor,
            members: vec![CommitteeNode {
                public_key: member.id,
            }],
            runtime_id: client_runtime,
            valid_for: 1,
        });

        h.host.emit_started(Version::new(1, 0, 0), None);
        // An insecure status without a policy admits all client runtimes.
        h.keymanager.publish_status(insecure_status(&h));
        wait_initialized(&h).await;
        eventually(|| h.worker.status().compute_runtime_count == 1).await;

        // The committee member becomes authorized once the watcher pushes the
        // committee into the access list.
        let frame = noise_frame("secret_method");
        time::timeout(Duration::from_secs(5), async {
            loop {
                if h.worker
                    .call_enclave(&member_peer, Kind::NoiseSession, frame.clone())
                    .await
                    .is_ok()
                {
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("committee member authorized in time");

        // Strangers stay rejected for non-public methods.
        assert!(matches!(
            h.worker
                .call_enclave(&stranger, Kind::NoiseSession, frame.clone())
                .await,
            Err(KeyManagerError::NotAuthorized)
        ));

        // But public methods pass for anyone.
        h.worker
            .call_enclave(&stranger, Kind::NoiseSession, noise_frame("get_public_key"))
            .await
            .unwrap();

        // Local queries are always refused on this path.
        assert!(matches!(
            h.worker
                .call_enclave(&member_peer, Kind::LocalQuery, frame)
                .await,
            Err(KeyManagerError::UnsupportedRpcKind)
        ));
    }

    #[tokio::test]
    async fn test_enclave_warm_up() {
        let h = harness(false, 50).await;

        // The last twenty epochs all have published secrets.
        for epoch in 31..=50 {
            h.keymanager.insert_secret(h.host.make_signed_secret(epoch));
        }

        h.host.emit_started(Version::new(1, 0, 0), None);
        eventually(|| h.host.loaded().len() == 20).await;

        // Secrets were loaded oldest first, ending at the current epoch.
        let epochs: Vec<_> = h.host.loaded().iter().map(|s| s.secret.epoch).collect();
        assert_eq!(epochs, (31..=50).collect::<Vec<_>>());
        assert_eq!(h.worker.status().last_loaded_epoch, Some(50));
    }

    #[tokio::test]
    async fn test_stop() {
        let h = harness(false, 0).await;
        h.worker.stop();
        time::timeout(Duration::from_secs(5), h.worker.wait_quit())
            .await
            .expect("worker stopped in time");
    }

    #[tokio::test]
    async fn test_load_retry_cap() {
        let h = harness(false, 0).await;

        h.host.emit_started(Version::new(1, 0, 0), None);
        h.host.set_fail_loads(true);

        // An observed secret that can never be loaded.
        h.keymanager.publish_secret(h.host.make_signed_secret(1));
        eventually(|| h.host.load_attempts() == 1).await;

        // Each new block retries the whole queue until the budget is spent.
        for height in 1..=10 {
            h.consensus.advance_block(height);
            time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(h.host.load_attempts(), 5);
    }
}
