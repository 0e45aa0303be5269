use super::{benchlist, timeout, types::Parameters};
use crate::{Supervisor, Vm};
use commonware_cryptography::{Digest, PublicKey};
use std::time::Duration;

/// Configuration for a snowman engine instance (one chain).
pub struct Config<P: PublicKey, D: Digest, V: Vm<Digest = D>, Z: Supervisor<PublicKey = P>> {
    /// The local node's identity.
    pub me: P,

    /// The virtual machine that builds, verifies, and executes blocks.
    pub vm: V,

    /// The validator set polled for preferences.
    pub supervisor: Z,

    /// Snowball parameters.
    pub params: Parameters,

    /// Beacons (and their stake weights) to bootstrap from. Empty for a
    /// standalone start.
    pub beacons: Vec<(P, u64)>,

    /// Stake weight a container must gather across beacons to be
    /// treated as accepted during bootstrap. Conventionally a strict
    /// majority of the total beacon weight.
    pub bootstrap_alpha: u64,

    /// Attempts to fetch one container's ancestry before the bootstrap
    /// restarts from frontier-gathering.
    pub bootstrap_max_attempts: u32,

    /// Bootstrap restarts tolerated before the chain fails.
    pub bootstrap_restart_budget: u32,

    /// Adaptive request timeouts.
    pub timeout: timeout::Config,

    /// Peer benching policy.
    pub benchlist: benchlist::Config,

    /// Maximum number of events buffered from the network and VM pumps
    /// before backpressure.
    pub mailbox_size: usize,

    /// Half-life of per-peer CPU accounting in the fair queue.
    pub cpu_halflife: Duration,

    /// Maximum containers in one ancestors response.
    pub max_ancestors: usize,

    /// Maximum cumulative bytes in one ancestors response
    /// (conventionally 4/5 of the wire frame limit).
    pub max_ancestors_bytes: usize,

    /// Maximum wall-clock time spent collecting one ancestors response.
    pub max_time_fetching_ancestors: Duration,

    /// Peers sampled when gossiping a freshly accepted block (0
    /// disables gossip).
    pub gossip_sample: usize,

    /// Interval between periodic re-gossips of the last accepted block
    /// (`None` disables the timer).
    pub gossip_interval: Option<Duration>,
}

impl<P: PublicKey, D: Digest, V: Vm<Digest = D>, Z: Supervisor<PublicKey = P>> Config<P, D, V, Z> {
    /// Enforce that the configuration is valid.
    pub fn assert(&self) {
        self.params.assert();
        self.timeout.assert();
        self.benchlist.assert();
        assert!(self.mailbox_size > 0, "mailbox must buffer at least one event");
        assert!(
            self.cpu_halflife > Duration::default(),
            "cpu halflife must be positive"
        );
        assert!(self.max_ancestors > 0, "must serve at least one ancestor");
        assert!(
            self.max_ancestors_bytes > 0,
            "ancestor byte budget must be positive"
        );
        if !self.beacons.is_empty() {
            let total: u64 = self.beacons.iter().map(|(_, weight)| weight).sum();
            assert!(
                self.bootstrap_alpha > 0 && self.bootstrap_alpha <= total,
                "bootstrap alpha must be positive and achievable"
            );
            assert!(
                self.bootstrap_max_attempts > 0,
                "must attempt each fetch at least once"
            );
        }
    }
}
