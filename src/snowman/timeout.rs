use super::types::{RequestId, RequestKind};
use commonware_cryptography::PublicKey;
use commonware_runtime::Clock;
use commonware_utils::PrioritySet;
use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};
use tracing::trace;

/// Configuration for the adaptive timeout manager.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Timeout used before any latency has been observed.
    pub initial: Duration,
    /// Lower clamp on the adaptive timeout.
    pub min: Duration,
    /// Upper clamp on the adaptive timeout.
    pub max: Duration,
    /// Multiplier applied to the latency estimate.
    pub coefficient: f64,
    /// Half-life of the latency estimate: observations this old carry
    /// half the weight of a fresh one.
    pub halflife: Duration,
}

impl Config {
    pub fn assert(&self) {
        assert!(self.min <= self.max, "min timeout must not exceed max");
        assert!(
            self.initial >= self.min && self.initial <= self.max,
            "initial timeout must be within the clamp"
        );
        assert!(self.coefficient >= 1.0, "coefficient must be at least 1");
        assert!(
            self.halflife > Duration::default(),
            "halflife must be positive"
        );
    }
}

/// Fires each registered request exactly once at its deadline unless
/// cancelled first, adapting the deadline horizon to observed latency.
pub struct Timeouts<E: Clock, P: PublicKey> {
    context: E,
    cfg: Config,

    /// Exponential moving average of observed latency, in seconds.
    estimate: f64,
    last_observation: Option<SystemTime>,

    kinds: HashMap<(P, RequestId), (RequestKind, SystemTime)>,
    deadlines: PrioritySet<(P, RequestId), SystemTime>,
}

impl<E: Clock, P: PublicKey> Timeouts<E, P> {
    pub fn new(context: E, cfg: Config) -> Self {
        cfg.assert();
        let estimate = cfg.initial.as_secs_f64() / cfg.coefficient;
        Self {
            context,
            cfg,
            estimate,
            last_observation: None,
            kinds: HashMap::new(),
            deadlines: PrioritySet::new(),
        }
    }

    /// The current timeout duration: `clamp(estimate * coefficient, min, max)`.
    pub fn current(&self) -> Duration {
        let timeout = Duration::from_secs_f64(self.estimate * self.cfg.coefficient);
        timeout.clamp(self.cfg.min, self.cfg.max)
    }

    /// Register a request, returning the deadline at which it will fire.
    ///
    /// Re-registering the same (peer, id) pushes the deadline out.
    pub fn register(&mut self, peer: P, id: RequestId, kind: RequestKind) -> SystemTime {
        let now = self.context.current();
        let deadline = now + self.current();
        self.kinds.insert((peer.clone(), id), (kind, now));
        self.deadlines.put((peer, id), deadline);
        deadline
    }

    /// Cancel a request because its response arrived, feeding the
    /// observed latency into the estimate. Returns the request kind if
    /// the request was still outstanding.
    pub fn cancel(&mut self, peer: &P, id: RequestId) -> Option<RequestKind> {
        let key = (peer.clone(), id);
        let (kind, start) = self.kinds.remove(&key)?;
        self.deadlines.remove(&key);

        let now = self.context.current();
        let elapsed = now.duration_since(start).unwrap_or_default();
        self.observe(now, elapsed.as_secs_f64());
        trace!(?elapsed, timeout = ?self.current(), "response observed");
        Some(kind)
    }

    /// Remove a request without observing latency (the caller already
    /// synthesized a local failure for it).
    pub fn remove(&mut self, peer: &P, id: RequestId) -> Option<RequestKind> {
        let key = (peer.clone(), id);
        let (kind, _) = self.kinds.remove(&key)?;
        self.deadlines.remove(&key);
        Some(kind)
    }

    /// Earliest outstanding deadline.
    pub fn next(&self) -> Option<SystemTime> {
        self.deadlines.peek().map(|(_, deadline)| *deadline)
    }

    /// Pop every request whose deadline has passed, counting each as a
    /// full-timeout latency observation.
    pub fn expired(&mut self) -> Vec<(P, RequestId, RequestKind)> {
        let now = self.context.current();
        let mut fired = Vec::new();
        while let Some((_, deadline)) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let ((peer, id), _) = self.deadlines.pop().expect("peeked entry must exist");
            let (kind, _) = self
                .kinds
                .remove(&(peer.clone(), id))
                .expect("deadline without registration");
            let timeout = self.current().as_secs_f64();
            self.observe(now, timeout);
            fired.push((peer, id, kind));
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    fn observe(&mut self, now: SystemTime, latency: f64) {
        // Older estimates decay with the configured half-life.
        let weight = match self.last_observation {
            Some(last) => {
                let dt = now.duration_since(last).unwrap_or_default().as_secs_f64();
                0.5f64.powf(dt / self.cfg.halflife.as_secs_f64()).min(0.9)
            }
            None => 0.0,
        };
        self.estimate = weight * self.estimate + (1.0 - weight) * latency;
        self.last_observation = Some(now);
    }
}
