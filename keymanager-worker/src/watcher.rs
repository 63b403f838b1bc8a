//! Client runtime committee watchers.
use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keymanager_api::{
    crypto::signature::PublicKey,
    namespace::Namespace,
    registry::Node,
    scheduler::CommitteeKind,
    KeyManagerError,
};

use crate::{
    backend::{Beacon, Registry, Scheduler},
    logger::get_logger,
    worker::Command,
};

/// A watcher tracking the executor committee of a single client runtime.
///
/// On every epoch transition the watcher re-fetches the committee and freezes
/// the tracked node set; only descriptor updates of tracked nodes are applied
/// afterwards. Access list updates are pushed into the worker loop through a
/// narrow command channel, so the loop remains the sole writer of worker
/// state.
pub(crate) struct ClientRuntimeWatcher {
    runtime_id: Namespace,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<dyn Registry>,
    beacon: Arc<dyn Beacon>,
    cmd_tx: mpsc::Sender<Command>,
    stopper: CancellationToken,
    logger: slog::Logger,
}

impl ClientRuntimeWatcher {
    /// Create a new watcher for the given client runtime.
    pub(crate) fn new(
        runtime_id: Namespace,
        scheduler: Arc<dyn Scheduler>,
        registry: Arc<dyn Registry>,
        beacon: Arc<dyn Beacon>,
        cmd_tx: mpsc::Sender<Command>,
        stopper: CancellationToken,
    ) -> Self {
        Self {
            runtime_id,
            scheduler,
            registry,
            beacon,
            cmd_tx,
            stopper,
            logger: get_logger("worker/keymanager/watcher"),
        }
    }

    /// Start the watcher task.
    pub(crate) fn start(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        slog::info!(self.logger, "starting client runtime watcher";
            "runtime_id" => %self.runtime_id,
        );

        let mut epochs = self.beacon.watch_epochs();
        let mut node_updates = self.registry.watch_nodes();
        let stopper = self.stopper.clone();

        // Node descriptors tracked for the current committee.
        let mut tracked: BTreeMap<PublicKey, Node> = BTreeMap::new();

        // Fetch the current committee immediately; the runtime may have been
        // authorized in the middle of an epoch.
        self.refresh(&mut tracked).await;

        loop {
            tokio::select! {
                maybe_epoch = epochs.recv() => {
                    if maybe_epoch.is_none() {
                        break;
                    }
                    self.refresh(&mut tracked).await;
                }
                Some(node) = node_updates.recv() => {
                    // The tracked set is frozen; only updates of tracked
                    // nodes are applied.
                    if let Some(entry) = tracked.get_mut(&node.id) {
                        *entry = node;
                        self.push_access_list(&tracked).await;
                    }
                }
                _ = stopper.cancelled() => break,
            }
        }

        slog::info!(self.logger, "client runtime watcher stopped";
            "runtime_id" => %self.runtime_id,
        );
    }

    /// Re-fetch executor committee membership for the runtime and push the
    /// resulting access list.
    async fn refresh(&self, tracked: &mut BTreeMap<PublicKey, Node>) {
        match self.fetch_committee_nodes().await {
            Ok(nodes) => {
                *tracked = nodes;
                self.push_access_list(tracked).await;
            }
            Err(err) => {
                // Transient failures are retried on the next epoch.
                slog::warn!(self.logger, "failed to refresh committee";
                    "err" => %err,
                    "runtime_id" => %self.runtime_id,
                );
            }
        }
    }

    async fn fetch_committee_nodes(
        &self,
    ) -> Result<BTreeMap<PublicKey, Node>, KeyManagerError> {
        let mut nodes = BTreeMap::new();
        let committees = self.scheduler.get_committees(self.runtime_id).await?;
        for committee in committees {
            if committee.kind != CommitteeKind::ComputeExecutor {
                continue;
            }
            for member in &committee.members {
                if nodes.contains_key(&member.public_key) {
                    continue;
                }
                let node = self.registry.get_node(member.public_key).await?;
                nodes.insert(member.public_key, node);
            }
        }
        Ok(nodes)
    }

    async fn push_access_list(&self, tracked: &BTreeMap<PublicKey, Node>) {
        let _ = self
            .cmd_tx
            .send(Command::SetAccessList {
                runtime_id: self.runtime_id,
                nodes: tracked.values().cloned().collect(),
            })
            .await;
    }
}
