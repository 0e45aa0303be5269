use super::{
    blocked::{Blocker, Dependent},
    bootstrap::{Bootstrapper, Progress},
    consensus::{Decisions, Topological},
    metrics::{MessageLabel, Metrics},
    poll::Polls,
    requests::Requests,
    sender::Sender,
    types::{Error, Message, Parameters, RequestId, RequestKind, GOSSIP_REQUEST_ID},
};
use crate::{Block, Status, Supervisor, Vm, VmEvent};
use commonware_cryptography::{Digest, PublicKey};
use commonware_p2p::Sender as NetSender;
use commonware_runtime::Clock;
use rand::Rng;
use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, SystemTime},
};
use tracing::{debug, info, trace, warn};

enum State {
    Bootstrapping,
    Running,
}

/// Work released by the blocker, executed in FIFO order until the
/// agenda drains.
type Agenda<P, D> = VecDeque<(Dependent<P, D>, bool)>;

/// The engine core: hosts the bootstrapper and the consensus instance,
/// converts peer messages and VM notifications into consensus
/// operations, and drives new polls.
///
/// All methods run on the single chain worker; nothing here is shared.
pub struct Transitive<
    E: Clock + Rng,
    P: PublicKey,
    D: Digest,
    V: Vm<Digest = D>,
    Z: Supervisor<PublicKey = P>,
    S: NetSender<PublicKey = P>,
> {
    context: E,
    vm: V,
    supervisor: Z,
    sender: Sender<E, P, D, S>,

    params: Parameters,
    max_ancestors: usize,
    max_ancestors_bytes: usize,
    max_time_fetching_ancestors: Duration,
    gossip_sample: usize,

    state: State,
    bootstrap: Bootstrapper<P, D>,
    consensus: Option<Topological<D>>,

    /// Outstanding preference polls.
    polls: Polls<P, D>,
    /// Outstanding Get requests.
    blk_reqs: Requests<P, D>,
    /// Fetched blocks not yet delivered to consensus.
    pending: HashSet<D>,
    /// Deferred actions waiting on block issuance.
    blocked: Blocker<P, D>,

    metrics: Metrics,
}

impl<
        E: Clock + Rng,
        P: PublicKey,
        D: Digest,
        V: Vm<Digest = D>,
        Z: Supervisor<PublicKey = P>,
        S: NetSender<PublicKey = P>,
    > Transitive<E, P, D, V, Z, S>
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: E,
        vm: V,
        supervisor: Z,
        sender: Sender<E, P, D, S>,
        params: Parameters,
        bootstrap: Bootstrapper<P, D>,
        max_ancestors: usize,
        max_ancestors_bytes: usize,
        max_time_fetching_ancestors: Duration,
        gossip_sample: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            context,
            vm,
            supervisor,
            sender,
            params,
            max_ancestors,
            max_ancestors_bytes,
            max_time_fetching_ancestors,
            gossip_sample,
            state: State::Bootstrapping,
            bootstrap,
            consensus: None,
            polls: Polls::new(params.alpha),
            blk_reqs: Requests::new(),
            pending: HashSet::new(),
            blocked: Blocker::new(),
            metrics,
        }
    }

    /// Begin bootstrapping (or go straight to consensus when there is
    /// nothing to bootstrap from).
    pub async fn start(&mut self) -> Result<(), Error> {
        info!("initializing consensus engine");
        let progress = self.bootstrap.start(&mut self.sender).await?;
        self.on_progress(progress).await
    }

    pub fn bootstrapped(&self) -> bool {
        matches!(self.state, State::Running)
    }

    /// Earliest outstanding request deadline, for the worker to sleep
    /// on.
    pub fn next_timeout(&self) -> Option<SystemTime> {
        self.sender.next_timeout()
    }

    /// Requests whose deadline has passed; the worker dispatches the
    /// matching failures.
    pub fn expired(&mut self) -> Vec<(P, RequestId, RequestKind)> {
        self.sender.expired()
    }

    /// Dispatch one inbound message.
    pub async fn handle(&mut self, peer: P, message: Message<D>) -> Result<(), Error> {
        self.metrics
            .received
            .get_or_create(&MessageLabel::new(message.op()))
            .inc();
        match message {
            Message::GetAcceptedFrontier { id, .. } => {
                let last = self.vm.last_accepted().await;
                self.sender.send_accepted_frontier(peer, id, vec![last]).await;
            }
            Message::AcceptedFrontier { id, containers } => {
                if self.sender.on_response(&peer, id).is_none() {
                    self.drop_unexpected(&peer, id, "accepted_frontier");
                    return Ok(());
                }
                if let State::Bootstrapping = self.state {
                    let progress = self
                        .bootstrap
                        .accepted_frontier(&mut self.sender, peer, containers)
                        .await?;
                    self.on_progress(progress).await?;
                }
            }
            Message::GetAccepted { id, containers, .. } => {
                let mut filtered = Vec::with_capacity(containers.len());
                for container in containers {
                    if self.vm.status(&container).await == Status::Accepted {
                        filtered.push(container);
                    }
                }
                self.sender.send_accepted(peer, id, filtered).await;
            }
            Message::Accepted { id, containers } => {
                if self.sender.on_response(&peer, id).is_none() {
                    self.drop_unexpected(&peer, id, "accepted");
                    return Ok(());
                }
                if let State::Bootstrapping = self.state {
                    let progress = self
                        .bootstrap
                        .accepted(&mut self.sender, &mut self.vm, peer, containers, true)
                        .await?;
                    self.on_progress(progress).await?;
                }
            }
            Message::GetAncestors { id, container, .. } => {
                self.serve_ancestors(peer, id, container).await;
            }
            Message::MultiPut { id, containers } => {
                if self.sender.on_response(&peer, id).is_none() {
                    self.drop_unexpected(&peer, id, "multi_put");
                    return Ok(());
                }
                if let State::Bootstrapping = self.state {
                    let progress = self
                        .bootstrap
                        .multi_put(&mut self.sender, &mut self.vm, peer, id, containers)
                        .await?;
                    self.on_progress(progress).await?;
                }
            }
            Message::Get { id, container, .. } => {
                // If we don't have the block, the peer is not following
                // the protocol or the block was pruned: drop silently.
                match self.vm.get_block(&container).await {
                    Some(block) => {
                        self.sender.send_put(peer, id, container, block.bytes).await;
                    }
                    None => debug!(?peer, id, ?container, "dropping get for unknown block"),
                }
            }
            Message::Put {
                id,
                container,
                bytes,
            } => {
                let gossip = id == GOSSIP_REQUEST_ID;
                if !gossip && self.sender.on_response(&peer, id).is_none() {
                    self.drop_unexpected(&peer, id, "put");
                    return Ok(());
                }
                if !self.bootstrapped() {
                    // We sent no Gets before bootstrapping finished.
                    debug!(?peer, id, "dropping put during bootstrap");
                    return Ok(());
                }
                match self.vm.parse_block(bytes).await {
                    Some(block) => {
                        let mut agenda = Agenda::new();
                        self.insert_from(peer, block, &mut agenda).await?;
                        self.process(&mut agenda).await?;
                    }
                    None => {
                        debug!(?peer, id, ?container, "failed to parse block");
                        if !gossip {
                            self.get_failed(peer, id).await?;
                        }
                    }
                }
            }
            Message::PushQuery {
                id,
                container,
                bytes,
                ..
            } => {
                if !self.bootstrapped() {
                    debug!(?peer, id, "dropping push query during bootstrap");
                    return Ok(());
                }
                // We didn't ask for this block, so a parse failure just
                // drops the query.
                let Some(block) = self.vm.parse_block(bytes).await else {
                    debug!(?peer, id, ?container, "failed to parse queried block");
                    return Ok(());
                };
                let queried = block.id;
                let mut agenda = Agenda::new();
                self.insert_from(peer.clone(), block, &mut agenda).await?;
                self.process(&mut agenda).await?;
                self.register_convincer(peer, id, queried).await?;
            }
            Message::PullQuery { id, container, .. } => {
                if !self.bootstrapped() {
                    debug!(?peer, id, "dropping pull query during bootstrap");
                    return Ok(());
                }
                let mut agenda = Agenda::new();
                self.fetch_or_insert(peer.clone(), container, &mut agenda).await?;
                self.process(&mut agenda).await?;
                self.register_convincer(peer, id, container).await?;
            }
            Message::Chits { id, votes } => {
                if self.sender.on_response(&peer, id).is_none() {
                    self.drop_unexpected(&peer, id, "chits");
                    return Ok(());
                }
                if !self.bootstrapped() {
                    debug!(?peer, id, "dropping chits during bootstrap");
                    return Ok(());
                }
                // A linear chain carries exactly one vote per chit.
                if votes.len() != 1 {
                    debug!(?peer, id, votes = votes.len(), "expected exactly one chit");
                    self.query_failed(peer, id).await?;
                    return Ok(());
                }
                let vote = votes[0];
                let mut agenda = Agenda::new();
                self.fetch_or_insert(peer.clone(), vote, &mut agenda).await?;
                self.process(&mut agenda).await?;
                if !self.issued(&vote).await && self.issuance_pending(&vote) {
                    self.blocked.register(
                        vec![vote],
                        Dependent::Voter {
                            peer,
                            request_id: id,
                            vote,
                        },
                    );
                } else {
                    // Issued, or provably not going to be: count the
                    // vote now (consensus drops votes it cannot place).
                    self.apply_vote(peer, id, Some(vote)).await?;
                }
            }
            Message::AppRequest { id, payload, .. } => {
                if let Some(response) = self.vm.app_request(payload).await {
                    self.sender.send_app_response(peer, id, response).await;
                }
            }
            Message::AppResponse { id, payload } => {
                if self.sender.on_response(&peer, id).is_none() {
                    self.drop_unexpected(&peer, id, "app_response");
                    return Ok(());
                }
                self.vm.app_response(payload).await;
            }
            Message::AppGossip { payload } => {
                self.vm.app_response(payload).await;
            }
        }
        self.update_gauges();
        Ok(())
    }

    /// Dispatch one synthesized request failure.
    pub async fn handle_failure(
        &mut self,
        peer: P,
        id: RequestId,
        kind: RequestKind,
    ) -> Result<(), Error> {
        self.sender.on_failure(&peer, id);
        match kind {
            RequestKind::GetAcceptedFrontier => {
                if let State::Bootstrapping = self.state {
                    // A timed-out beacon is treated as reporting an
                    // empty frontier.
                    let progress = self
                        .bootstrap
                        .accepted_frontier(&mut self.sender, peer, Vec::new())
                        .await?;
                    self.on_progress(progress).await?;
                }
            }
            RequestKind::GetAccepted => {
                if let State::Bootstrapping = self.state {
                    let progress = self
                        .bootstrap
                        .accepted(&mut self.sender, &mut self.vm, peer, Vec::new(), false)
                        .await?;
                    self.on_progress(progress).await?;
                }
            }
            RequestKind::GetAncestors => {
                if let State::Bootstrapping = self.state {
                    let progress = self
                        .bootstrap
                        .get_ancestors_failed(&mut self.sender, &mut self.vm, peer, id)
                        .await?;
                    self.on_progress(progress).await?;
                }
            }
            RequestKind::Get => self.get_failed(peer, id).await?,
            RequestKind::PullQuery | RequestKind::PushQuery => {
                if self.bootstrapped() {
                    self.query_failed(peer, id).await?;
                }
            }
            RequestKind::AppRequest => {
                debug!(?peer, id, "app request failed");
            }
        }
        self.update_gauges();
        Ok(())
    }

    /// Dispatch one VM notification.
    pub async fn notify(&mut self, event: VmEvent) -> Result<(), Error> {
        if !self.bootstrapped() {
            debug!(?event, "dropping vm notification during bootstrap");
            return Ok(());
        }
        match event {
            VmEvent::PendingTxs => {
                let Some(block) = self.vm.build_block().await else {
                    debug!("vm could not build a block");
                    return Ok(());
                };
                // The new block should extend the preferred tip;
                // anything else has a worse chance of being confirmed.
                let preference = self.preference();
                if block.parent != preference {
                    warn!(parent = ?block.parent, expected = ?preference, "built block off the preferred tip");
                }
                let mut agenda = Agenda::new();
                self.insert_all(block, &mut agenda).await?;
                self.process(&mut agenda).await?;
            }
        }
        self.update_gauges();
        Ok(())
    }

    /// The current preferred tip.
    pub fn preference(&self) -> D {
        self.consensus
            .as_ref()
            .expect("consensus is initialized after bootstrap")
            .preference()
    }

    /// True once the live tree holds only the accepted head.
    pub fn finalized(&self) -> bool {
        self.consensus
            .as_ref()
            .map(Topological::finalized)
            .unwrap_or(true)
    }

    pub async fn shutdown(&mut self) {
        info!("shutting down consensus engine");
    }

    /// Re-gossip the last accepted block so stragglers hear about the
    /// frontier even when no new blocks are being produced.
    pub async fn gossip(&mut self) {
        if !self.bootstrapped() {
            return;
        }
        let last = self.vm.last_accepted().await;
        trace!(?last, "gossiping accepted frontier");
        self.gossip_accepted(last).await;
    }

    fn drop_unexpected(&self, peer: &P, id: RequestId, op: &'static str) {
        self.metrics.dropped.inc();
        debug!(?peer, id, op, "dropping unexpected response");
    }

    async fn on_progress(&mut self, progress: Progress) -> Result<(), Error> {
        if matches!(progress, Progress::Done) && !self.bootstrapped() {
            self.finish_bootstrapping().await?;
        }
        Ok(())
    }

    /// Hand consensus the last accepted block and enter normal
    /// operation.
    async fn finish_bootstrapping(&mut self) -> Result<(), Error> {
        let last = self.vm.last_accepted().await;
        self.consensus = Some(Topological::new(self.params, last));
        self.state = State::Running;

        // Bootstrapping into an oracle block: its options must be issued
        // immediately so preferences stay well formed.
        let block = self
            .vm
            .get_block(&last)
            .await
            .ok_or(Error::MissingLastAccepted)?;
        if block.oracle {
            let mut agenda = Agenda::new();
            for option in self.vm.options(&last).await {
                agenda.push_back((Dependent::Issue(option), true));
            }
            self.process(&mut agenda).await?;
        } else {
            self.vm.set_preference(last).await;
        }

        info!(?last, "bootstrapping finished");
        Ok(())
    }

    /// Run released work to fixpoint. Delivering a block can release
    /// more work; everything lands on the same agenda, never the call
    /// stack.
    async fn process(&mut self, agenda: &mut Agenda<P, D>) -> Result<(), Error> {
        while let Some((dependent, fulfilled)) = agenda.pop_front() {
            match dependent {
                Dependent::Issue(block) => {
                    if fulfilled {
                        self.deliver(block, agenda).await?;
                    } else {
                        // The ancestry is unobtainable; so is this
                        // block.
                        let id = block.id;
                        self.pending.remove(&id);
                        agenda.extend(self.blocked.abandon(&id));
                    }
                }
                Dependent::Voter {
                    peer,
                    request_id,
                    vote,
                } => {
                    let vote = fulfilled.then_some(vote);
                    self.apply_vote(peer, request_id, vote).await?;
                }
                Dependent::Convincer { peer, request_id } => {
                    let preference = self.preference();
                    self.sender
                        .send_chits(peer, request_id, vec![preference])
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Add a block whose parent has been issued: verify it, attach it to
    /// the tree, poll for it, and release everything waiting on it.
    async fn deliver(&mut self, block: Block<D>, agenda: &mut Agenda<P, D>) -> Result<(), Error> {
        let id = block.id;
        if self.issued(&id).await {
            return Ok(());
        }
        self.pending.remove(&id);

        if !self.vm.verify(&id).await {
            debug!(?id, "block failed verification, dropping");
            agenda.extend(self.blocked.abandon(&id));
            return Ok(());
        }

        trace!(?id, "adding block to consensus");
        let live = self
            .consensus
            .as_mut()
            .expect("consensus is initialized after bootstrap")
            .add(id, block.parent);
        if !live {
            // The ancestry was pruned before this block arrived.
            self.vm.reject(&id).await;
            self.metrics.rejected.inc();
        }

        // Verify and add each oracle option; an option that fails
        // verification is abandoned, and added options are never
        // reverted.
        let mut options = Vec::new();
        if live && block.oracle {
            for option in self.vm.options(&id).await {
                if !self.vm.verify(&option.id).await {
                    debug!(id = ?option.id, "oracle option failed verification, dropping");
                    self.pending.remove(&option.id);
                    agenda.extend(self.blocked.abandon(&option.id));
                    continue;
                }
                self.consensus
                    .as_mut()
                    .expect("consensus is initialized after bootstrap")
                    .add(option.id, option.parent);
                options.push(option);
            }
        }

        let preference = self.preference();
        self.vm.set_preference(preference).await;

        if live {
            self.push_sample(block).await;
        }
        agenda.extend(self.blocked.fulfill(&id));
        for option in options {
            self.pending.remove(&option.id);
            let option_id = option.id;
            self.push_sample(option).await;
            agenda.extend(self.blocked.fulfill(&option_id));
        }

        self.repoll().await;
        Ok(())
    }

    /// Whether the block is decided or in the live tree.
    async fn issued(&mut self, id: &D) -> bool {
        if let Some(consensus) = self.consensus.as_ref() {
            if consensus.contains(id) {
                return true;
            }
        }
        self.vm.status(id).await.decided()
    }

    /// Issue the branch ending at `id`, requesting it from `peer` if it
    /// is missing locally.
    async fn fetch_or_insert(
        &mut self,
        peer: P,
        id: D,
        agenda: &mut Agenda<P, D>,
    ) -> Result<(), Error> {
        match self.vm.get_block(&id).await {
            Some(block) => self.insert_from(peer, block, agenda).await,
            None => {
                self.send_request(peer, id).await;
                Ok(())
            }
        }
    }

    /// Issue the branch ending at `block`, requesting any missing
    /// ancestor from `peer`.
    async fn insert_from(
        &mut self,
        peer: P,
        block: Block<D>,
        agenda: &mut Agenda<P, D>,
    ) -> Result<(), Error> {
        let mut block = block;
        loop {
            if self.issued(&block.id).await || self.pending.contains(&block.id) {
                return Ok(());
            }
            let parent = block.parent;
            self.insert(block, agenda).await?;
            match self.vm.get_block(&parent).await {
                Some(parent_block) => block = parent_block,
                None => {
                    self.send_request(peer, parent).await;
                    return Ok(());
                }
            }
        }
    }

    /// Issue the branch ending at `block` without a peer to fetch from:
    /// a missing ancestor with no outstanding request abandons the
    /// branch.
    async fn insert_all(
        &mut self,
        block: Block<D>,
        agenda: &mut Agenda<P, D>,
    ) -> Result<(), Error> {
        let mut block = block;
        loop {
            if self.issued(&block.id).await || self.pending.contains(&block.id) {
                return Ok(());
            }
            let parent = block.parent;
            self.insert(block, agenda).await?;
            match self.vm.get_block(&parent).await {
                Some(parent_block) => block = parent_block,
                None => {
                    if !self.blk_reqs.contains(&parent) {
                        warn!(?parent, "branch waiting on unobtainable ancestor");
                        agenda.extend(self.blocked.abandon(&parent));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Register a fetched block to be delivered once its parent is
    /// issued.
    async fn insert(&mut self, block: Block<D>, agenda: &mut Agenda<P, D>) -> Result<(), Error> {
        let id = block.id;
        self.pending.insert(id);
        // Any outstanding request for this block is now satisfied.
        self.blk_reqs.remove_any(&id);

        let parent = block.parent;
        let mut deps = Vec::new();
        if !self.issued(&parent).await {
            trace!(?id, ?parent, "block waiting on parent");
            deps.push(parent);
        }
        if let Some(ready) = self.blocked.register(deps, Dependent::Issue(block)) {
            agenda.push_back((ready, true));
        }
        Ok(())
    }

    /// Whether issuance of `id` is still in flight (waiting on
    /// ancestry, or on an outstanding fetch).
    fn issuance_pending(&self, id: &D) -> bool {
        self.pending.contains(id) || self.blk_reqs.contains(id)
    }

    /// Send chits for a query once the queried block resolves.
    ///
    /// A block that is neither issued nor in flight (e.g. it failed
    /// verification) is answered immediately with the current
    /// preference.
    async fn register_convincer(
        &mut self,
        peer: P,
        id: RequestId,
        container: D,
    ) -> Result<(), Error> {
        if !self.issued(&container).await && self.issuance_pending(&container) {
            self.blocked.register(
                vec![container],
                Dependent::Convincer {
                    peer,
                    request_id: id,
                },
            );
            return Ok(());
        }
        let preference = self.preference();
        self.sender.send_chits(peer, id, vec![preference]).await;
        Ok(())
    }

    /// An outstanding Get failed: release everything waiting on the
    /// requested block.
    async fn get_failed(&mut self, peer: P, id: RequestId) -> Result<(), Error> {
        let Some(container) = self.blk_reqs.remove(&peer, id) else {
            debug!(?peer, id, "get failed without outstanding request");
            return Ok(());
        };
        let mut agenda: Agenda<P, D> = self.blocked.abandon(&container).into_iter().collect();
        self.process(&mut agenda).await
    }

    /// A query failed: the peer contributes an empty vote.
    async fn query_failed(&mut self, peer: P, id: RequestId) -> Result<(), Error> {
        self.apply_vote(peer, id, None).await
    }

    /// Feed one response into its poll; a completed poll is applied to
    /// consensus.
    async fn apply_vote(&mut self, peer: P, id: RequestId, vote: Option<D>) -> Result<(), Error> {
        let Some(votes) = self.polls.vote(id, &peer, vote) else {
            return Ok(());
        };
        trace!(id, votes = votes.len(), "poll completed");
        let decisions = self
            .consensus
            .as_mut()
            .expect("consensus is initialized after bootstrap")
            .record_poll(votes);
        self.apply_decisions(decisions).await?;

        let preference = self.preference();
        self.vm.set_preference(preference).await;
        self.repoll().await;
        Ok(())
    }

    /// Execute the decisions of one vote round against the VM, and
    /// gossip freshly accepted blocks.
    async fn apply_decisions(&mut self, decisions: Decisions<D>) -> Result<(), Error> {
        for id in &decisions.rejected {
            self.vm.reject(id).await;
            self.metrics.rejected.inc();
        }
        for id in &decisions.accepted {
            info!(?id, "accepted block");
            self.vm
                .accept(id)
                .await
                .map_err(|err| Error::VmAccept(err.to_string()))?;
            self.metrics.accepted.inc();
            self.gossip_accepted(*id).await;
        }
        Ok(())
    }

    /// Send an accepted block as an unsolicited Put to a random sample
    /// of peers.
    async fn gossip_accepted(&mut self, id: D) {
        if self.gossip_sample == 0 {
            return;
        }
        let Some(block) = self.vm.get_block(&id).await else {
            return;
        };
        let peers = self.supervisor.sample(&mut self.context, self.gossip_sample);
        self.sender.gossip_put(peers, id, block.bytes).await;
    }

    /// Top polls back up to the concurrency target, sampling on the
    /// current preference.
    async fn repoll(&mut self) {
        let preference = self.preference();
        while self.polls.len() < self.params.concurrent_repolls {
            if !self.pull_sample(preference).await {
                break;
            }
        }
    }

    async fn pull_sample(&mut self, id: D) -> bool {
        let Some((request, sampled)) = self.sample() else {
            return false;
        };
        self.sender.send_pull_query(sampled, request, id).await;
        true
    }

    async fn push_sample(&mut self, block: Block<D>) {
        let Some((request, sampled)) = self.sample() else {
            return;
        };
        self.sender
            .send_push_query(sampled, request, block.id, block.bytes)
            .await;
    }

    fn sample(&mut self) -> Option<(RequestId, Vec<P>)> {
        let sampled = self.supervisor.sample(&mut self.context, self.params.k);
        if sampled.len() < self.params.k {
            warn!(
                sampled = sampled.len(),
                k = self.params.k,
                "dropping query: insufficient validators"
            );
            return None;
        }
        let request = self.sender.next_request_id();
        if !self.polls.add(request, sampled.clone()) {
            return None;
        }
        Some((request, sampled))
    }

    /// Request a block from `peer`, keeping at most one outstanding Get
    /// per container.
    async fn send_request(&mut self, peer: P, container: D) {
        if self.blk_reqs.contains(&container) {
            return;
        }
        let request = self.sender.next_request_id();
        self.blk_reqs.add(peer.clone(), request, container);
        trace!(?peer, request, ?container, "requesting block");
        self.sender.send_get(peer, request, container).await;
    }

    /// Reply with up to `max_ancestors` containers, child first, bounded
    /// by cumulative size and wall-clock time.
    async fn serve_ancestors(&mut self, peer: P, id: RequestId, container: D) {
        let start = self.context.current();
        let Some(mut block) = self.vm.get_block(&container).await else {
            debug!(?peer, id, ?container, "dropping get ancestors for unknown block");
            return;
        };

        // Each container costs a length prefix on the wire.
        let mut total = block.bytes.len() + 4;
        let mut containers = vec![block.bytes.clone()];
        while containers.len() < self.max_ancestors && block.height > 0 {
            let elapsed = self
                .context
                .current()
                .duration_since(start)
                .unwrap_or_default();
            if elapsed >= self.max_time_fetching_ancestors {
                break;
            }
            let Some(parent) = self.vm.get_block(&block.parent).await else {
                break;
            };
            total += parent.bytes.len() + 4;
            if total > self.max_ancestors_bytes {
                break;
            }
            containers.push(parent.bytes.clone());
            block = parent;
        }
        self.sender.send_multi_put(peer, id, containers).await;
    }

    fn update_gauges(&mut self) {
        self.metrics.requests.set(self.blk_reqs.len() as i64);
        self.metrics.pending.set(self.pending.len() as i64);
        self.metrics.blocked.set(self.blocked.len() as i64);
        self.metrics.polls.set(self.polls.len() as i64);
        self.metrics.benched.set(self.sender.len_benched() as i64);
    }
}
