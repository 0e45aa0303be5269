use commonware_cryptography::PublicKey;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, SystemTime},
};

/// Interval-weighted CPU accounting per peer.
///
/// Charged time decays with a half-life, so a peer's utilization
/// reflects its recent demand rather than its lifetime total.
pub struct Meter<P: PublicKey> {
    halflife: Duration,
    usage: HashMap<P, (f64, SystemTime)>,
}

impl<P: PublicKey> Meter<P> {
    pub fn new(halflife: Duration) -> Self {
        assert!(halflife > Duration::default(), "halflife must be positive");
        Self {
            halflife,
            usage: HashMap::new(),
        }
    }

    /// Attribute `spent` processing time to `peer`.
    pub fn charge(&mut self, peer: &P, now: SystemTime, spent: Duration) {
        let decayed = self.utilization(peer, now) + spent.as_secs_f64();
        if decayed < 1e-9 {
            self.usage.remove(peer);
            return;
        }
        self.usage.insert(peer.clone(), (decayed, now));
    }

    /// Recent CPU seconds attributed to `peer`, decayed to `now`.
    pub fn utilization(&self, peer: &P, now: SystemTime) -> f64 {
        let Some((usage, last)) = self.usage.get(peer) else {
            return 0.0;
        };
        let dt = now.duration_since(*last).unwrap_or_default().as_secs_f64();
        usage * 0.5f64.powf(dt / self.halflife.as_secs_f64())
    }
}

/// A per-peer fair queue.
///
/// Each push lands on its sender's queue; each pop serves the next peer
/// in rotation, preferring peers under their fair share of recent CPU.
/// Overweight peers are deprioritized but never starved: if every
/// queued peer is over its share, the rotation proceeds anyway.
pub struct FairQueue<P: PublicKey, T> {
    queues: HashMap<P, VecDeque<T>>,
    rotation: VecDeque<P>,
    len: usize,
}

impl<P: PublicKey, T> FairQueue<P, T> {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            rotation: VecDeque::new(),
            len: 0,
        }
    }

    pub fn push(&mut self, peer: P, item: T) {
        let queue = self.queues.entry(peer.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(peer);
        }
        queue.push_back(item);
        self.len += 1;
    }

    /// Take one item from the fairest queued peer.
    pub fn pop(&mut self, meter: &Meter<P>, now: SystemTime) -> Option<(P, T)> {
        if self.rotation.is_empty() {
            return None;
        }

        // A peer is within its share when it has used at most an even
        // split of the recent CPU spent on currently queued peers.
        let active = self.rotation.len();
        let total: f64 = self
            .rotation
            .iter()
            .map(|peer| meter.utilization(peer, now))
            .sum();
        let share = total / active as f64;

        let position = self
            .rotation
            .iter()
            .position(|peer| meter.utilization(peer, now) <= share)
            .unwrap_or(0);
        let peer = self.rotation.remove(position).expect("position is valid");

        let queue = self.queues.get_mut(&peer).expect("queued peer has items");
        let item = queue.pop_front().expect("queued peer has items");
        self.len -= 1;
        if queue.is_empty() {
            self.queues.remove(&peer);
        } else {
            self.rotation.push_back(peer.clone());
        }
        Some((peer, item))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
