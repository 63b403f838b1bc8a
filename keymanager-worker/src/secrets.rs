//! Ephemeral secret generation.
use std::{collections::HashSet, sync::Arc};

use rand::Rng;
use tokio::sync::mpsc;

use keymanager_api::{
    beacon::EpochTime,
    crypto::signature::PublicKey,
    namespace::Namespace,
    types::{
        GenerateEphemeralSecretRequest, GenerateEphemeralSecretResponse,
        METHOD_GENERATE_EPHEMERAL_SECRET,
    },
    KeyManagerError,
};

use crate::{
    attestation,
    backend::{publish_ephemeral_secret_tx, Consensus, KeyManagerBackend, Registry},
    enclave_rpc::EnclaveClient,
};

/// Maximum number of ephemeral secrets kept in the pending replication queue,
/// and the number of recent secrets fetched on enclave start.
pub(crate) const EPHEMERAL_SECRET_CACHE_SIZE: usize = 20;

/// Maximum number of attempts to generate an epoch's secret.
pub(crate) const GENERATE_SECRET_RETRIES: u32 = 5;

/// Maximum number of load iterations before the pending queue is dropped.
pub(crate) const LOAD_SECRET_RETRIES: u32 = 5;

/// Portion of the epoch interval within which generation is scheduled, in
/// percent. The remainder leaves publication and replication enough time to
/// finish before the epoch ends.
const GENERATE_HEIGHT_PERCENTILE: u64 = 90;

/// Sentinel height at which generation is disarmed.
pub(crate) const GENERATION_DISARMED: u64 = u64::MAX;

/// Scheduling state for per-epoch ephemeral secret generation.
#[derive(Debug)]
pub(crate) struct GenerationState {
    /// Block height at which to attempt generation; `GENERATION_DISARMED`
    /// when disarmed.
    pub height: u64,
    /// Whether a generation task is currently running.
    pub in_progress: bool,
    /// Number of failed generation attempts in the current epoch.
    pub retries: u32,
}

impl GenerationState {
    pub fn new() -> Self {
        Self {
            height: GENERATION_DISARMED,
            in_progress: false,
            retries: 0,
        }
    }

    /// Arm generation at the given height and reset the retry budget.
    pub fn arm(&mut self, height: u64) {
        self.height = height;
        self.retries = 0;
    }

    /// Disarm generation until the next epoch.
    pub fn disarm(&mut self) {
        self.height = GENERATION_DISARMED;
    }

    /// Whether generation is currently armed.
    pub fn is_armed(&self) -> bool {
        self.height != GENERATION_DISARMED
    }

    /// Whether a generation attempt is due at the given block height.
    pub fn is_due(&self, height: u64) -> bool {
        self.is_armed() && !self.in_progress && height >= self.height
    }
}

/// Pick a generation height for an epoch beginning at `first_height`,
/// uniformly at random within the first portion of the epoch.
pub(crate) fn generation_height(first_height: u64, epoch_interval: u64) -> u64 {
    let window = epoch_interval * GENERATE_HEIGHT_PERCENTILE / 100;
    if window == 0 {
        return first_height;
    }
    first_height + rand::thread_rng().gen_range(0..window)
}

/// Outcome of a detached ephemeral secret generation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GenerateOutcome {
    /// The epoch's secret has been published, by this node or another member.
    Published,
    /// The attempt failed and may be retried on a later block.
    Failed,
    /// The node is not in the key manager committee for this epoch.
    NotInCommittee,
}

/// Inputs captured for a detached ephemeral secret generation attempt.
///
/// The task owns snapshots of everything it needs so the worker loop never
/// blocks on it; the outcome is reported through a capacity-1 channel.
pub(crate) struct GenerateTask {
    pub runtime_id: Namespace,
    pub node_id: PublicKey,
    /// Epoch the secret is generated for.
    pub epoch: EpochTime,
    /// Current key manager committee.
    pub nodes: Vec<PublicKey>,
    /// RAK the generated secret must verify under.
    pub rak: PublicKey,

    pub keymanager: Arc<dyn KeyManagerBackend>,
    pub registry: Arc<dyn Registry>,
    pub consensus: Arc<dyn Consensus>,
    pub enclave: Arc<EnclaveClient>,
    pub logger: slog::Logger,
}

impl GenerateTask {
    /// Run one generation attempt on a detached task, reporting the outcome
    /// on `done`.
    pub(crate) fn spawn(
        self,
        done: mpsc::Sender<GenerateOutcome>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let outcome = match self.run().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    slog::warn!(self.logger, "failed to generate ephemeral secret";
                        "err" => %err,
                        "epoch" => self.epoch,
                    );
                    GenerateOutcome::Failed
                }
            };
            let _ = done.try_send(outcome);
        })
    }

    async fn run(&self) -> Result<GenerateOutcome, KeyManagerError> {
        // Skip generation when the secret has already been published. Races
        // with other committee members are accepted; consensus de-duplicates
        // publications for the same runtime and epoch.
        match self
            .keymanager
            .get_ephemeral_secret(self.runtime_id, self.epoch)
            .await
        {
            Ok(_) => return Ok(GenerateOutcome::Published),
            Err(KeyManagerError::NoSuchEphemeralSecret) => (),
            Err(err) => return Err(err),
        }

        // Only key manager committee members may generate.
        if !self.nodes.contains(&self.node_id) {
            slog::info!(self.logger, "not in the key manager committee";
                "epoch" => self.epoch,
            );
            return Ok(GenerateOutcome::NotInCommittee);
        }

        // Ask the enclave to generate the secret.
        let response: GenerateEphemeralSecretResponse = self
            .enclave
            .call_local(
                METHOD_GENERATE_EPHEMERAL_SECRET,
                GenerateEphemeralSecretRequest { epoch: self.epoch },
            )
            .await?;
        let signed_secret = response.signed_secret;

        // Gather the committee REKs the secret must be encrypted to, skipping
        // nodes that cannot receive secrets.
        let mut reks = HashSet::new();
        for id in &self.nodes {
            let node = self.registry.get_node(*id).await?;
            if let Ok(Some(rek)) = attestation::runtime_encryption_key(node.tee.as_ref()) {
                reks.insert(rek);
            }
        }

        // Verify the enclave's signature before publishing.
        signed_secret.verify(self.epoch, &reks, &self.rak)?;

        // Publish the secret.
        self.consensus
            .submit_tx(publish_ephemeral_secret_tx(signed_secret))
            .await?;

        slog::info!(self.logger, "ephemeral secret published"; "epoch" => self.epoch);

        Ok(GenerateOutcome::Published)
    }
}
