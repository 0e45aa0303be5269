//! Reconstructs local state to the network's accepted frontier before
//! consensus begins.
//!
//! The state machine advances through three phases: gather accepted
//! frontiers from every beacon, confirm which frontier ids the beacons
//! actually consider accepted (weighted by stake), then fetch missing
//! ancestry and execute it in dependency order. Receiving zero accepted
//! ids, or exhausting the retry budget for a required container,
//! restarts the machine from frontier-gathering until the restart budget
//! runs out.

mod jobs;
pub use jobs::Jobs;

use super::{
    metrics::Metrics,
    requests::Requests,
    sender::Sender,
    types::{Error, RequestId},
};
use crate::{Block, Status, Vm};
use commonware_cryptography::{Digest, PublicKey};
use commonware_p2p::Sender as NetSender;
use commonware_runtime::Clock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Whether the bootstrap is still running or has caught up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
}

/// Collects accepted frontiers from beacons, fetches missing ancestors,
/// and drives the blocked-job queue until local state reaches the
/// accepted tip.
pub struct Bootstrapper<P: PublicKey, D: Digest> {
    beacons: Vec<P>,
    weights: HashMap<P, u64>,
    /// Stake weight a container needs to count as accepted.
    alpha: u64,

    pending_frontier: HashSet<P>,
    frontier: BTreeSet<D>,

    pending_accepted: HashSet<P>,
    accepted_weight: BTreeMap<D, u64>,
    accepted: Vec<D>,

    /// Beacons that answered the accepted-query; ancestor fetches
    /// round-robin across them.
    responders: Vec<P>,
    next_responder: usize,

    fetching: Requests<P, D>,
    attempts: HashMap<D, u32>,
    max_attempts: u32,

    restarts: u32,
    restart_budget: u32,

    jobs: Jobs<D>,
    metrics: Metrics,
}

impl<P: PublicKey, D: Digest> Bootstrapper<P, D> {
    pub fn new(
        beacons: Vec<(P, u64)>,
        alpha: u64,
        max_attempts: u32,
        restart_budget: u32,
        metrics: Metrics,
    ) -> Self {
        let weights: HashMap<P, u64> = beacons.iter().cloned().collect();
        let beacons: Vec<P> = beacons.into_iter().map(|(peer, _)| peer).collect();
        Self {
            beacons,
            weights,
            alpha,
            pending_frontier: HashSet::new(),
            frontier: BTreeSet::new(),
            pending_accepted: HashSet::new(),
            accepted_weight: BTreeMap::new(),
            accepted: Vec::new(),
            responders: Vec::new(),
            next_responder: 0,
            fetching: Requests::new(),
            attempts: HashMap::new(),
            max_attempts,
            restarts: 0,
            restart_budget,
            jobs: Jobs::new(),
            metrics,
        }
    }

    /// Begin frontier-gathering. Completes immediately when no beacons
    /// are configured (a fresh, standalone network).
    pub async fn start<E: Clock, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
    ) -> Result<Progress, Error> {
        if self.beacons.is_empty() {
            info!("bootstrapping skipped: no beacons configured");
            return Ok(Progress::Done);
        }

        self.pending_frontier = self.beacons.iter().cloned().collect();
        self.pending_accepted = self.beacons.iter().cloned().collect();
        self.frontier.clear();
        self.accepted_weight.clear();
        self.accepted.clear();
        self.responders.clear();
        self.next_responder = 0;
        // Outstanding fetches from a previous round are forgotten; their
        // eventual failures no longer match anything and are dropped.
        self.fetching = Requests::new();
        self.attempts.clear();
        self.jobs.clear();

        let id = sender.next_request_id();
        sender
            .send_get_accepted_frontier(self.beacons.clone(), id)
            .await;
        Ok(Progress::Pending)
    }

    /// A beacon reported its accepted frontier (empty on timeout).
    pub async fn accepted_frontier<E: Clock, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
        peer: P,
        containers: Vec<D>,
    ) -> Result<Progress, Error> {
        if !self.pending_frontier.remove(&peer) {
            debug!(?peer, "unexpected accepted frontier");
            return Ok(Progress::Pending);
        }
        self.frontier.extend(containers);

        if !self.pending_frontier.is_empty() {
            return Ok(Progress::Pending);
        }

        let id = sender.next_request_id();
        let frontier: Vec<D> = self.frontier.iter().copied().collect();
        sender
            .send_get_accepted(self.beacons.clone(), id, frontier)
            .await;
        Ok(Progress::Pending)
    }

    /// A beacon confirmed the subset of the frontier it considers
    /// accepted. `responded` is false for a synthesized (timeout)
    /// reply, which contributes no weight and is excluded from the
    /// fetch rotation.
    pub async fn accepted<E: Clock, V: Vm<Digest = D>, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
        vm: &mut V,
        peer: P,
        containers: Vec<D>,
        responded: bool,
    ) -> Result<Progress, Error> {
        if !self.pending_accepted.remove(&peer) {
            debug!(?peer, "unexpected accepted response");
            return Ok(Progress::Pending);
        }
        if responded {
            let weight = self.weights.get(&peer).copied().unwrap_or_default();
            for container in containers {
                *self.accepted_weight.entry(container).or_default() += weight;
            }
            self.responders.push(peer);
        }

        if !self.pending_accepted.is_empty() {
            return Ok(Progress::Pending);
        }

        self.accepted = self
            .accepted_weight
            .iter()
            .filter(|(_, weight)| **weight >= self.alpha)
            .map(|(container, _)| *container)
            .collect();
        if self.accepted.is_empty() {
            warn!(
                "bootstrapping finished with no accepted frontier; \
                 restarting"
            );
            return self.restart(sender).await;
        }

        info!(
            containers = self.accepted.len(),
            "bootstrapping accepted frontier confirmed"
        );
        let targets = self.accepted.clone();
        for container in targets {
            if vm.status(&container).await == Status::Accepted {
                continue;
            }
            self.fetch(sender, container).await?;
        }
        self.maybe_finished(vm).await
    }

    /// A batch of ancestors arrived: child first, then its parents.
    pub async fn multi_put<E: Clock, V: Vm<Digest = D>, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
        vm: &mut V,
        peer: P,
        id: RequestId,
        containers: Vec<bytes::Bytes>,
    ) -> Result<Progress, Error> {
        let Some(expected) = self.fetching.remove(&peer, id) else {
            debug!(?peer, id, "unexpected multi put");
            return Ok(Progress::Pending);
        };

        let mut batch = containers.into_iter();
        let first = match batch.next() {
            Some(first) => first,
            None => {
                debug!(?peer, "empty multi put");
                self.fetch(sender, expected).await?;
                return self.maybe_finished(vm).await;
            }
        };
        let block = match vm.parse_block(first).await {
            Some(block) if block.id == expected => block,
            _ => {
                debug!(?peer, ?expected, "multi put started with wrong container");
                self.fetch(sender, expected).await?;
                return self.maybe_finished(vm).await;
            }
        };
        self.metrics.bootstrap_fetched.inc();

        // Walk the chain toward the root, queueing a job per container.
        let mut deepest = block.clone();
        self.enqueue(vm, block).await;
        for bytes in batch {
            let Some(block) = vm.parse_block(bytes).await else {
                debug!(?peer, "undecodable ancestor, ignoring rest of batch");
                break;
            };
            if block.id != deepest.parent {
                debug!(?peer, "non-contiguous ancestor, ignoring rest of batch");
                break;
            }
            self.metrics.bootstrap_fetched.inc();
            deepest = block.clone();
            self.enqueue(vm, block).await;
        }

        // Chase the missing ancestry below the batch.
        let missing = deepest.parent;
        if !vm.status(&missing).await.decided()
            && !self.jobs.contains(&missing)
            && !self.fetching.contains(&missing)
        {
            self.fetch(sender, missing).await?;
        }

        self.execute_ready(vm).await?;
        self.maybe_finished(vm).await
    }

    /// A `GetAncestors` request failed; retry from the next responder.
    pub async fn get_ancestors_failed<E: Clock, V: Vm<Digest = D>, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
        vm: &mut V,
        peer: P,
        id: RequestId,
    ) -> Result<Progress, Error> {
        let Some(container) = self.fetching.remove(&peer, id) else {
            return Ok(Progress::Pending);
        };
        let attempts = self.attempts.get(&container).copied().unwrap_or_default();
        if attempts >= self.max_attempts {
            warn!(
                ?container,
                attempts, "exhausted ancestor fetch attempts; restarting bootstrap"
            );
            return self.restart(sender).await;
        }
        self.fetch(sender, container).await?;
        self.maybe_finished(vm).await
    }

    async fn enqueue<V: Vm<Digest = D>>(&mut self, vm: &mut V, block: Block<D>) {
        if vm.status(&block.id).await.decided() {
            return;
        }
        let parent_ready = vm.status(&block.parent).await == Status::Accepted;
        self.jobs.push(block, parent_ready);
    }

    async fn execute_ready<V: Vm<Digest = D>>(&mut self, vm: &mut V) -> Result<(), Error> {
        while let Some(block) = self.jobs.pop_runnable() {
            debug!(id = ?block.id, height = block.height, "executing bootstrapped block");
            vm.accept(&block.id)
                .await
                .map_err(|err| Error::VmAccept(err.to_string()))?;
            self.metrics.bootstrap_executed.inc();
            self.jobs.ready(&block.id);
        }
        Ok(())
    }

    async fn fetch<E: Clock, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
        container: D,
    ) -> Result<(), Error> {
        if self.fetching.contains(&container) {
            return Ok(());
        }
        *self.attempts.entry(container).or_default() += 1;

        // Rotate through the beacons that vouched for the frontier.
        let pool = if self.responders.is_empty() {
            &self.beacons
        } else {
            &self.responders
        };
        let peer = pool[self.next_responder % pool.len()].clone();
        self.next_responder = self.next_responder.wrapping_add(1);

        let id = sender.next_request_id();
        self.fetching.add(peer.clone(), id, container);
        sender.send_get_ancestors(peer, id, container).await;
        Ok(())
    }

    async fn maybe_finished<V: Vm<Digest = D>>(&mut self, vm: &mut V) -> Result<Progress, Error> {
        if !self.fetching.is_empty() || !self.jobs.is_empty() {
            return Ok(Progress::Pending);
        }
        for container in &self.accepted {
            if vm.status(container).await != Status::Accepted {
                return Ok(Progress::Pending);
            }
        }
        info!("bootstrapping caught up with the accepted frontier");
        Ok(Progress::Done)
    }

    async fn restart<E: Clock, S: NetSender<PublicKey = P>>(
        &mut self,
        sender: &mut Sender<E, P, D, S>,
    ) -> Result<Progress, Error> {
        self.restarts += 1;
        if self.restarts > self.restart_budget {
            return Err(Error::BootstrapFailed(self.restarts - 1));
        }
        warn!(restart = self.restarts, "restarting bootstrap");
        self.start(sender).await
    }
}
