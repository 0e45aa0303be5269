use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
};

/// Buckets for message dispatch latency (seconds).
const DISPATCH_BUCKETS: [f64; 12] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Label identifying a message op.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabel {
    pub op: String,
}

impl MessageLabel {
    pub fn new(op: &'static str) -> Self {
        Self { op: op.into() }
    }
}

/// Metrics for one chain's consensus pipeline.
#[derive(Clone)]
pub struct Metrics {
    /// Messages dispatched to the engine, by op.
    pub received: Family<MessageLabel, Counter>,
    /// Messages dropped because their deadline passed while queued.
    pub expired: Counter,
    /// Messages dropped as malformed or unexpected.
    pub dropped: Counter,
    /// Time spent dispatching a message into the engine.
    pub dispatch_duration: Histogram,
    /// Outstanding container requests.
    pub requests: Gauge,
    /// Fetched blocks waiting on a missing dependency.
    pub pending: Gauge,
    /// Deferred actions waiting on block issuance.
    pub blocked: Gauge,
    /// Outstanding polls.
    pub polls: Gauge,
    /// Blocks accepted.
    pub accepted: Counter,
    /// Blocks rejected.
    pub rejected: Counter,
    /// Requests that fired their timeout.
    pub timeouts: Counter,
    /// Currently benched peers.
    pub benched: Gauge,
    /// Requests short-circuited because the peer was benched.
    pub failed_benched: Counter,
    /// Containers fetched during bootstrap.
    pub bootstrap_fetched: Counter,
    /// Jobs executed during bootstrap.
    pub bootstrap_executed: Counter,
}

impl Metrics {
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self {
            received: Family::default(),
            expired: Counter::default(),
            dropped: Counter::default(),
            dispatch_duration: Histogram::new(DISPATCH_BUCKETS.into_iter()),
            requests: Gauge::default(),
            pending: Gauge::default(),
            blocked: Gauge::default(),
            polls: Gauge::default(),
            accepted: Counter::default(),
            rejected: Counter::default(),
            timeouts: Counter::default(),
            benched: Gauge::default(),
            failed_benched: Counter::default(),
            bootstrap_fetched: Counter::default(),
            bootstrap_executed: Counter::default(),
        };
        context.register(
            "received_messages",
            "Messages dispatched to the engine, by op",
            metrics.received.clone(),
        );
        context.register(
            "expired_messages",
            "Messages dropped because their deadline passed while queued",
            metrics.expired.clone(),
        );
        context.register(
            "dropped_messages",
            "Messages dropped as malformed or unexpected",
            metrics.dropped.clone(),
        );
        context.register(
            "dispatch_duration",
            "Time spent dispatching a message into the engine",
            metrics.dispatch_duration.clone(),
        );
        context.register(
            "outstanding_requests",
            "Outstanding container requests",
            metrics.requests.clone(),
        );
        context.register(
            "pending_blocks",
            "Fetched blocks waiting on a missing dependency",
            metrics.pending.clone(),
        );
        context.register(
            "blocked_actions",
            "Deferred actions waiting on block issuance",
            metrics.blocked.clone(),
        );
        context.register("outstanding_polls", "Outstanding polls", metrics.polls.clone());
        context.register("accepted_blocks", "Blocks accepted", metrics.accepted.clone());
        context.register("rejected_blocks", "Blocks rejected", metrics.rejected.clone());
        context.register(
            "request_timeouts",
            "Requests that fired their timeout",
            metrics.timeouts.clone(),
        );
        context.register(
            "benched_peers",
            "Currently benched peers",
            metrics.benched.clone(),
        );
        context.register(
            "failed_benched",
            "Requests short-circuited because the peer was benched",
            metrics.failed_benched.clone(),
        );
        context.register(
            "bootstrap_fetched",
            "Containers fetched during bootstrap",
            metrics.bootstrap_fetched.clone(),
        );
        context.register(
            "bootstrap_executed",
            "Jobs executed during bootstrap",
            metrics.bootstrap_executed.clone(),
        );
        metrics
    }
}
