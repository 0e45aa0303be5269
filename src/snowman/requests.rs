use super::types::RequestId;
use commonware_cryptography::{Digest, PublicKey};
use std::collections::HashMap;

/// Outstanding container requests, keyed both ways.
///
/// At most one request is outstanding per container id, so a reverse
/// index suffices to guarantee the uniqueness invariant.
pub struct Requests<P: PublicKey, D: Digest> {
    requests: HashMap<(P, RequestId), D>,
    containers: HashMap<D, (P, RequestId)>,
}

impl<P: PublicKey, D: Digest> Requests<P, D> {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            containers: HashMap::new(),
        }
    }

    /// Record a request for `container`.
    ///
    /// Panics if a request is already outstanding for the container;
    /// callers check [Self::contains] before issuing.
    pub fn add(&mut self, peer: P, id: RequestId, container: D) {
        assert!(
            !self.containers.contains_key(&container),
            "container already requested"
        );
        self.requests.insert((peer.clone(), id), container);
        self.containers.insert(container, (peer, id));
    }

    /// Remove and return the container a response (or failure) from
    /// `(peer, id)` corresponds to.
    pub fn remove(&mut self, peer: &P, id: RequestId) -> Option<D> {
        let container = self.requests.remove(&(peer.clone(), id))?;
        self.containers.remove(&container);
        Some(container)
    }

    /// Remove any outstanding request for `container` (the container
    /// arrived from another source).
    pub fn remove_any(&mut self, container: &D) -> bool {
        let Some(key) = self.containers.remove(container) else {
            return false;
        };
        self.requests.remove(&key);
        true
    }

    pub fn contains(&self, container: &D) -> bool {
        self.containers.contains_key(container)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
