use super::types::RequestId;
use crate::Block;
use commonware_cryptography::{Digest, PublicKey};
use std::collections::HashMap;

/// A deferred action waiting on blocks being issued.
#[derive(Clone, Debug)]
pub enum Dependent<P: PublicKey, D: Digest> {
    /// Add a fetched block to consensus once its parent is issued.
    Issue(Block<D>),
    /// Feed a chit into the poll identified by `request_id` once the
    /// voted block is issued (an abandoned dependency drops the vote).
    Voter {
        peer: P,
        request_id: RequestId,
        vote: D,
    },
    /// Answer a query with our preference once the queried block is
    /// issued or proven unobtainable.
    Convincer { peer: P, request_id: RequestId },
}

struct Entry<P: PublicKey, D: Digest> {
    missing: usize,
    abandoned: bool,
    dependent: Dependent<P, D>,
}

/// Tracks actions blocked on sets of block ids.
///
/// When the last dependency of an action is resolved — fulfilled
/// (issued) or abandoned (unobtainable) — the action is released exactly
/// once, tagged with whether every dependency was fulfilled.
pub struct Blocker<P: PublicKey, D: Digest> {
    next: u64,
    entries: HashMap<u64, Entry<P, D>>,
    by_dep: HashMap<D, Vec<u64>>,
}

impl<P: PublicKey, D: Digest> Blocker<P, D> {
    pub fn new() -> Self {
        Self {
            next: 0,
            entries: HashMap::new(),
            by_dep: HashMap::new(),
        }
    }

    /// Register `dependent` to run once every id in `deps` resolves.
    ///
    /// With no dependencies the action is ready immediately and handed
    /// back to the caller.
    pub fn register(
        &mut self,
        deps: Vec<D>,
        dependent: Dependent<P, D>,
    ) -> Option<Dependent<P, D>> {
        if deps.is_empty() {
            return Some(dependent);
        }
        let handle = self.next;
        self.next += 1;
        self.entries.insert(
            handle,
            Entry {
                missing: deps.len(),
                abandoned: false,
                dependent,
            },
        );
        for dep in deps {
            self.by_dep.entry(dep).or_default().push(handle);
        }
        None
    }

    /// Mark `id` fulfilled, releasing any actions it was the last
    /// dependency of. The flag on each released action is `true` iff all
    /// of its dependencies were fulfilled.
    pub fn fulfill(&mut self, id: &D) -> Vec<(Dependent<P, D>, bool)> {
        self.resolve(id, true)
    }

    /// Mark `id` abandoned: dependents are released with the abandoned
    /// flag once their remaining dependencies resolve.
    pub fn abandon(&mut self, id: &D) -> Vec<(Dependent<P, D>, bool)> {
        self.resolve(id, false)
    }

    fn resolve(&mut self, id: &D, fulfilled: bool) -> Vec<(Dependent<P, D>, bool)> {
        let mut ready = Vec::new();
        let Some(handles) = self.by_dep.remove(id) else {
            return ready;
        };
        for handle in handles {
            let Some(entry) = self.entries.get_mut(&handle) else {
                continue;
            };
            entry.missing -= 1;
            entry.abandoned |= !fulfilled;
            if entry.missing > 0 {
                continue;
            }
            let entry = self.entries.remove(&handle).expect("entry must exist");
            ready.push((entry.dependent, !entry.abandoned));
        }
        ready
    }

    /// Number of blocked actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        sha256::{hash, Digest as Sha256Digest},
        PrivateKeyExt as _, Signer as _,
    };

    fn peer() -> PublicKey {
        PrivateKey::from_seed(0).public_key()
    }

    fn voter(vote: Sha256Digest) -> Dependent<PublicKey, Sha256Digest> {
        Dependent::Voter {
            peer: peer(),
            request_id: 1,
            vote,
        }
    }

    fn block(id: Sha256Digest, parent: Sha256Digest) -> Block<Sha256Digest> {
        Block {
            id,
            parent,
            height: 1,
            bytes: Bytes::new(),
            oracle: false,
        }
    }

    #[test]
    fn test_no_deps_runs_immediately() {
        let mut blocker: Blocker<PublicKey, Sha256Digest> = Blocker::new();
        let ready = blocker.register(vec![], voter(hash(b"a")));
        assert!(ready.is_some());
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_fulfill_releases_once() {
        let a = hash(b"a");
        let mut blocker = Blocker::new();
        assert!(blocker.register(vec![a], voter(a)).is_none());
        assert_eq!(blocker.len(), 1);

        let ready = blocker.fulfill(&a);
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1);
        assert!(blocker.is_empty());

        // Resolving again is a no-op.
        assert!(blocker.fulfill(&a).is_empty());
    }

    #[test]
    fn test_abandon_taints_release() {
        let a = hash(b"a");
        let b = hash(b"b");
        let mut blocker: Blocker<PublicKey, Sha256Digest> = Blocker::new();
        let dependent = Dependent::Issue(block(hash(b"c"), a));
        assert!(blocker.register(vec![a, b], dependent).is_none());

        assert!(blocker.abandon(&a).is_empty());
        let ready = blocker.fulfill(&b);
        assert_eq!(ready.len(), 1);
        assert!(!ready[0].1, "any abandoned dependency taints the action");
    }

    #[test]
    fn test_multiple_dependents_on_one_id() {
        let a = hash(b"a");
        let mut blocker = Blocker::new();
        blocker.register(vec![a], voter(a));
        blocker.register(
            vec![a],
            Dependent::Convincer {
                peer: peer(),
                request_id: 2,
            },
        );

        let ready = blocker.fulfill(&a);
        assert_eq!(ready.len(), 2);
        assert!(blocker.is_empty());
    }
}
