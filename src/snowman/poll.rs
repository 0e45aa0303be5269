use super::{bag::Bag, types::RequestId};
use commonware_cryptography::{Digest, PublicKey};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// A single outstanding network poll.
///
/// Terminates early once some id reaches alpha or once the remaining
/// responses cannot push any id to alpha.
struct Poll<P: PublicKey, D: Digest> {
    pending: HashSet<P>,
    votes: Bag<D>,
}

impl<P: PublicKey, D: Digest> Poll<P, D> {
    fn new(sampled: Vec<P>) -> Self {
        Self {
            pending: sampled.into_iter().collect(),
            votes: Bag::new(),
        }
    }

    fn vote(&mut self, peer: &P, vote: Option<D>) {
        // Only sampled peers that have not yet answered may vote.
        if !self.pending.remove(peer) {
            return;
        }
        if let Some(vote) = vote {
            self.votes.add(vote);
        }
    }

    fn finished(&self, alpha: usize) -> bool {
        let pending = self.pending.len();
        if pending == 0 {
            return true;
        }
        // Terminated: no id can reach alpha anymore.
        if self.votes.len() + pending < alpha {
            return true;
        }
        // Decided: some id already has an alpha majority.
        if let Some((_, count)) = self.votes.mode() {
            if count >= alpha {
                return true;
            }
        }
        false
    }
}

/// The set of outstanding polls, keyed by request id.
pub struct Polls<P: PublicKey, D: Digest> {
    alpha: usize,
    polls: BTreeMap<RequestId, Poll<P, D>>,
}

impl<P: PublicKey, D: Digest> Polls<P, D> {
    pub fn new(alpha: usize) -> Self {
        Self {
            alpha,
            polls: BTreeMap::new(),
        }
    }

    /// Register a poll over `sampled`. Returns `false` (and drops the
    /// poll) if the request id is already in use.
    pub fn add(&mut self, id: RequestId, sampled: Vec<P>) -> bool {
        if self.polls.contains_key(&id) {
            debug!(id, "dropping poll with duplicate request id");
            return false;
        }
        self.polls.insert(id, Poll::new(sampled));
        true
    }

    /// Apply one response (`None` for a failed query). If the poll
    /// completes, it is removed and its votes returned.
    pub fn vote(&mut self, id: RequestId, peer: &P, vote: Option<D>) -> Option<Bag<D>> {
        let poll = self.polls.get_mut(&id)?;
        poll.vote(peer, vote);
        if !poll.finished(self.alpha) {
            return None;
        }
        let poll = self.polls.remove(&id).expect("poll must exist");
        Some(poll.votes)
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }
}
