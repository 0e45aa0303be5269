use commonware_cryptography::PublicKey;
use commonware_runtime::Clock;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

/// Configuration for peer benching.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Failures within `window` required to bench a peer.
    pub threshold: usize,
    /// Width of the rolling failure window.
    pub window: Duration,
    /// How long a benched peer stays excluded.
    pub duration: Duration,
}

impl Config {
    pub fn assert(&self) {
        assert!(self.threshold > 0, "threshold must be positive");
        assert!(self.window > Duration::default(), "window must be positive");
        assert!(
            self.duration > Duration::default(),
            "bench duration must be positive"
        );
    }
}

/// Temporarily excludes peers that fail too many requests in a rolling
/// window. Responses clear a peer's failures; bench expiry is checked
/// lazily on lookup.
pub struct Benchlist<E: Clock, P: PublicKey> {
    context: E,
    cfg: Config,
    failures: HashMap<P, VecDeque<SystemTime>>,
    benched: HashMap<P, SystemTime>,
}

impl<E: Clock, P: PublicKey> Benchlist<E, P> {
    pub fn new(context: E, cfg: Config) -> Self {
        cfg.assert();
        Self {
            context,
            cfg,
            failures: HashMap::new(),
            benched: HashMap::new(),
        }
    }

    /// Whether requests to `peer` should be short-circuited.
    pub fn is_benched(&mut self, peer: &P) -> bool {
        let Some(until) = self.benched.get(peer) else {
            return false;
        };
        if self.context.current() < *until {
            return true;
        }
        self.benched.remove(peer);
        debug!(?peer, "peer unbenched");
        false
    }

    /// A response arrived: the peer is behaving again.
    pub fn register_response(&mut self, peer: &P) {
        self.failures.remove(peer);
    }

    /// A request to `peer` failed. Returns true if this failure benched
    /// the peer.
    pub fn register_failure(&mut self, peer: P) -> bool {
        let now = self.context.current();
        if self.benched.contains_key(&peer) {
            return false;
        }

        let failures = self.failures.entry(peer.clone()).or_default();
        failures.push_back(now);
        while let Some(first) = failures.front() {
            if now.duration_since(*first).unwrap_or_default() <= self.cfg.window {
                break;
            }
            failures.pop_front();
        }
        if failures.len() < self.cfg.threshold {
            return false;
        }

        let until = now + self.cfg.duration;
        warn!(?peer, ?until, "benching peer");
        self.failures.remove(&peer);
        self.benched.insert(peer, until);
        true
    }

    /// Number of currently benched peers.
    pub fn len_benched(&mut self) -> usize {
        let now = self.context.current();
        self.benched.retain(|_, until| now < *until);
        self.benched.len()
    }
}
