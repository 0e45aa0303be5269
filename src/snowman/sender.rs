use super::{
    actors::handler::Loopback,
    benchlist::{self, Benchlist},
    metrics::Metrics,
    timeout::{self, Timeouts},
    types::{Message, RequestId, RequestKind, GOSSIP_REQUEST_ID},
};
use bytes::Bytes;
use commonware_cryptography::{Digest, PublicKey};
use commonware_p2p::{utils::codec::WrappedSender, Recipients, Sender as NetSender};
use commonware_runtime::Clock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Constructs outbound messages, registers request timeouts, consults
/// the benchlist, and loops self-addressed messages back onto the local
/// inbound queue.
///
/// Every request path upholds the same contract: for each intended
/// recipient, either the request is on the wire with a timeout
/// registered, or a local failure has been synthesized — so dependent
/// actions are always released.
pub struct Sender<E: Clock, P: PublicKey, D: Digest, S: NetSender<PublicKey = P>> {
    context: E,
    me: P,
    network: WrappedSender<S, Message<D>>,
    loopback: Loopback<P, D>,
    timeouts: Timeouts<E, P>,
    benchlist: Benchlist<E, P>,
    next_request_id: RequestId,
    metrics: Metrics,
}

impl<E: Clock, P: PublicKey, D: Digest, S: NetSender<PublicKey = P>> Sender<E, P, D, S> {
    pub fn new(
        context: E,
        me: P,
        network: WrappedSender<S, Message<D>>,
        loopback: Loopback<P, D>,
        timeout_cfg: timeout::Config,
        benchlist_cfg: benchlist::Config,
        metrics: Metrics,
    ) -> Self {
        let timeouts = Timeouts::new(context.clone(), timeout_cfg);
        let benchlist = Benchlist::new(context.clone(), benchlist_cfg);
        Self {
            context,
            me,
            network,
            loopback,
            timeouts,
            benchlist,
            next_request_id: 0,
            metrics,
        }
    }

    /// Allocate a fresh request id (the gossip id is never allocated).
    pub fn next_request_id(&mut self) -> RequestId {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == GOSSIP_REQUEST_ID {
            self.next_request_id = 0;
        }
        self.next_request_id
    }

    /// Earliest outstanding request deadline.
    pub fn next_timeout(&self) -> Option<SystemTime> {
        self.timeouts.next()
    }

    /// Pop requests whose deadline has passed, registering each as a
    /// failure with the benchlist.
    pub fn expired(&mut self) -> Vec<(P, RequestId, RequestKind)> {
        let fired = self.timeouts.expired();
        for (peer, _, _) in &fired {
            self.metrics.timeouts.inc();
            self.benchlist.register_failure(peer.clone());
        }
        fired
    }

    /// A response for `(peer, id)` is being processed: cancel its
    /// timeout. Returns the request kind if the request was still
    /// outstanding (an unexpected response returns `None`).
    pub fn on_response(&mut self, peer: &P, id: RequestId) -> Option<RequestKind> {
        let kind = self.timeouts.cancel(peer, id)?;
        self.benchlist.register_response(peer);
        Some(kind)
    }

    /// A synthesized failure for `(peer, id)` is being processed: drop
    /// the timeout without firing it.
    pub fn on_failure(&mut self, peer: &P, id: RequestId) {
        if self.timeouts.remove(peer, id).is_some() {
            self.benchlist.register_failure(peer.clone());
        }
    }

    pub fn len_benched(&mut self) -> usize {
        self.benchlist.len_benched()
    }

    /// Request deadline to advertise to peers, in unix seconds.
    fn deadline(&self) -> u64 {
        let now = self
            .context
            .current()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now + self.timeouts.current()).as_secs()
    }

    /// Fan a request out to `peers`.
    ///
    /// Self-addressed copies loop back through the mailbox (with a
    /// timeout, unless `self_fails` — some requests can never be served
    /// locally). Benched peers fail immediately. Peers the transport
    /// refuses get a timeout and an immediate synthesized failure that
    /// will cancel it.
    async fn request(
        &mut self,
        peers: Vec<P>,
        id: RequestId,
        kind: RequestKind,
        message: Message<D>,
        self_fails: bool,
    ) {
        let mut remote = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer == self.me {
                if self_fails {
                    self.loopback.failed(peer, id, kind);
                } else {
                    self.timeouts.register(peer.clone(), id, kind);
                    self.loopback.inbound(peer, message.clone());
                }
                continue;
            }
            if self.benchlist.is_benched(&peer) {
                self.metrics.failed_benched.inc();
                self.loopback.failed(peer, id, kind);
                continue;
            }
            remote.push(peer);
        }
        if remote.is_empty() {
            return;
        }

        let sent = match self
            .network
            .send(Recipients::Some(remote.clone()), message, false)
            .await
        {
            Ok(sent) => sent,
            Err(err) => {
                debug!(?err, op = kind.op(), "send failed");
                Vec::new()
            }
        };
        for peer in remote {
            // Register before synthesizing so the failure path always
            // finds (and clears) the entry.
            self.timeouts.register(peer.clone(), id, kind);
            if !sent.contains(&peer) {
                debug!(?peer, id, op = kind.op(), "failed to send request");
                self.loopback.failed(peer, id, kind);
            }
        }
    }

    /// Send a response to a single peer (fire-and-forget).
    async fn respond(&mut self, peer: P, message: Message<D>) {
        if peer == self.me {
            self.loopback.inbound(peer, message);
            return;
        }
        let op = message.op();
        match self
            .network
            .send(Recipients::One(peer.clone()), message, false)
            .await
        {
            Ok(sent) if sent.is_empty() => debug!(?peer, op, "failed to send response"),
            Ok(_) => {}
            Err(err) => debug!(?err, ?peer, op, "send failed"),
        }
    }

    pub async fn send_get_accepted_frontier(&mut self, peers: Vec<P>, id: RequestId) {
        let deadline = self.deadline();
        self.request(
            peers,
            id,
            RequestKind::GetAcceptedFrontier,
            Message::GetAcceptedFrontier { id, deadline },
            false,
        )
        .await;
    }

    pub async fn send_accepted_frontier(&mut self, peer: P, id: RequestId, containers: Vec<D>) {
        self.respond(peer, Message::AcceptedFrontier { id, containers })
            .await;
    }

    pub async fn send_get_accepted(&mut self, peers: Vec<P>, id: RequestId, containers: Vec<D>) {
        let deadline = self.deadline();
        self.request(
            peers,
            id,
            RequestKind::GetAccepted,
            Message::GetAccepted {
                id,
                deadline,
                containers,
            },
            false,
        )
        .await;
    }

    pub async fn send_accepted(&mut self, peer: P, id: RequestId, containers: Vec<D>) {
        self.respond(peer, Message::Accepted { id, containers }).await;
    }

    pub async fn send_get_ancestors(&mut self, peer: P, id: RequestId, container: D) {
        let deadline = self.deadline();
        self.request(
            vec![peer],
            id,
            RequestKind::GetAncestors,
            Message::GetAncestors {
                id,
                deadline,
                container,
            },
            true,
        )
        .await;
    }

    pub async fn send_multi_put(&mut self, peer: P, id: RequestId, containers: Vec<Bytes>) {
        self.respond(peer, Message::MultiPut { id, containers }).await;
    }

    pub async fn send_get(&mut self, peer: P, id: RequestId, container: D) {
        let deadline = self.deadline();
        // A Get to ourselves would only be issued for a block we don't
        // have, so it always fails.
        self.request(
            vec![peer],
            id,
            RequestKind::Get,
            Message::Get {
                id,
                deadline,
                container,
            },
            true,
        )
        .await;
    }

    pub async fn send_put(&mut self, peer: P, id: RequestId, container: D, bytes: Bytes) {
        self.respond(
            peer,
            Message::Put {
                id,
                container,
                bytes,
            },
        )
        .await;
    }

    pub async fn send_push_query(
        &mut self,
        peers: Vec<P>,
        id: RequestId,
        container: D,
        bytes: Bytes,
    ) {
        let deadline = self.deadline();
        self.request(
            peers,
            id,
            RequestKind::PushQuery,
            Message::PushQuery {
                id,
                deadline,
                container,
                bytes,
            },
            false,
        )
        .await;
    }

    pub async fn send_pull_query(&mut self, peers: Vec<P>, id: RequestId, container: D) {
        let deadline = self.deadline();
        self.request(
            peers,
            id,
            RequestKind::PullQuery,
            Message::PullQuery {
                id,
                deadline,
                container,
            },
            false,
        )
        .await;
    }

    pub async fn send_chits(&mut self, peer: P, id: RequestId, votes: Vec<D>) {
        self.respond(peer, Message::Chits { id, votes }).await;
    }

    pub async fn send_app_request(&mut self, peers: Vec<P>, id: RequestId, payload: Bytes) {
        let deadline = self.deadline();
        self.request(
            peers,
            id,
            RequestKind::AppRequest,
            Message::AppRequest {
                id,
                deadline,
                payload,
            },
            false,
        )
        .await;
    }

    pub async fn send_app_response(&mut self, peer: P, id: RequestId, payload: Bytes) {
        self.respond(peer, Message::AppResponse { id, payload }).await;
    }

    /// Gossip a container to `peers` with the reserved gossip request
    /// id. No timeouts are registered.
    pub async fn gossip_put(&mut self, peers: Vec<P>, container: D, bytes: Bytes) {
        let peers: Vec<P> = peers.into_iter().filter(|peer| *peer != self.me).collect();
        if peers.is_empty() {
            return;
        }
        let message = Message::Put {
            id: GOSSIP_REQUEST_ID,
            container,
            bytes,
        };
        if let Err(err) = self.network.send(Recipients::Some(peers), message, false).await {
            debug!(?err, "gossip send failed");
        }
    }

    /// Gossip opaque application bytes (fire-and-forget).
    pub async fn send_app_gossip(&mut self, recipients: Recipients<P>, payload: Bytes) {
        let message = Message::AppGossip { payload };
        if let Err(err) = self.network.send(recipients, message, false).await {
            debug!(?err, "app gossip send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snowman::{
        actors::handler::{Event, Loopback},
        metrics::Metrics,
    };
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        sha256::{hash, Digest as Sha256Digest},
        PrivateKeyExt as _, Signer as _,
    };
    use commonware_p2p::{
        simulated::{Config as NetworkConfig, Link, Network},
        utils::codec::wrap,
    };
    use commonware_runtime::{deterministic, Metrics as _, Runner};
    use futures::channel::mpsc;
    use std::time::Duration;

    const TIMEOUTS: timeout::Config = timeout::Config {
        initial: Duration::from_secs(2),
        min: Duration::from_millis(500),
        max: Duration::from_secs(10),
        coefficient: 2.0,
        halflife: Duration::from_secs(30),
    };

    const BENCHING: benchlist::Config = benchlist::Config {
        threshold: 3,
        window: Duration::from_secs(60),
        duration: Duration::from_secs(30),
    };

    struct Harness {
        sender: Sender<
            deterministic::Context,
            PublicKey,
            Sha256Digest,
            commonware_p2p::simulated::Sender<PublicKey>,
        >,
        other: PublicKey,
        loopback: mpsc::UnboundedReceiver<Event<PublicKey, Sha256Digest>>,
        /// Keeps the remote peer's inbox alive so sends are accepted.
        _remote: commonware_p2p::simulated::Receiver<PublicKey>,
    }

    /// A sender over a simulated network where `linked` controls whether
    /// the remote peer is reachable.
    async fn setup(context: &deterministic::Context, linked: bool) -> Harness {
        let me = PrivateKey::from_seed(0).public_key();
        let other = PrivateKey::from_seed(1).public_key();
        let (network, mut oracle) = Network::new(
            context.with_label("network"),
            NetworkConfig {
                max_size: 1024 * 1024,
            },
        );
        network.start();
        let (net_sender, me_receiver) = oracle.register(me.clone(), 0).await.unwrap();
        let (_, remote) = oracle.register(other.clone(), 0).await.unwrap();
        if linked {
            let link = Link {
                latency: 1.0,
                jitter: 0.0,
                success_rate: 1.0,
            };
            oracle
                .add_link(me.clone(), other.clone(), link)
                .await
                .unwrap();
        }

        let (loopback_sender, loopback) = mpsc::unbounded();
        let (wrapped, _) = wrap((), net_sender, me_receiver);
        let sender = Sender::new(
            context.clone(),
            me,
            wrapped,
            Loopback::new(loopback_sender),
            TIMEOUTS,
            BENCHING,
            Metrics::init(context),
        );
        Harness {
            sender,
            other,
            loopback,
            _remote: remote,
        }
    }

    fn expect_failed(
        loopback: &mut mpsc::UnboundedReceiver<Event<PublicKey, Sha256Digest>>,
        expected: &PublicKey,
        kind: RequestKind,
    ) -> RequestId {
        match loopback.try_next() {
            Ok(Some(Event::Failed { peer, id, kind: got })) => {
                assert_eq!(&peer, expected);
                assert_eq!(got, kind);
                id
            }
            _ => panic!("expected synthesized failure"),
        }
    }

    #[test]
    fn test_unreachable_peer_synthesizes_failure() {
        let executor = deterministic::Runner::seeded(0);
        executor.start(|context| async move {
            let mut harness = setup(&context, false).await;
            let other = harness.other.clone();

            let container = hash(b"x");
            harness.sender.send_get(other.clone(), 1, container).await;

            // A timeout was registered and an immediate failure
            // synthesized; processing the failure clears the timeout.
            assert!(harness.sender.next_timeout().is_some());
            let id = expect_failed(&mut harness.loopback, &other, RequestKind::Get);
            harness.sender.on_failure(&other, id);
            assert!(harness.sender.next_timeout().is_none());
        });
    }

    #[test]
    fn test_self_get_always_fails() {
        let executor = deterministic::Runner::seeded(0);
        executor.start(|context| async move {
            let mut harness = setup(&context, true).await;
            let me = PrivateKey::from_seed(0).public_key();

            harness.sender.send_get(me.clone(), 5, hash(b"x")).await;
            expect_failed(&mut harness.loopback, &me, RequestKind::Get);
            assert!(harness.sender.next_timeout().is_none());
        });
    }

    #[test]
    fn test_self_query_loops_back() {
        let executor = deterministic::Runner::seeded(0);
        executor.start(|context| async move {
            let mut harness = setup(&context, true).await;
            let me = PrivateKey::from_seed(0).public_key();

            let container = hash(b"x");
            harness
                .sender
                .send_pull_query(vec![me.clone()], 6, container)
                .await;
            match harness.loopback.try_next() {
                Ok(Some(Event::Inbound { peer, message })) => {
                    assert_eq!(peer, me);
                    assert!(matches!(
                        message,
                        Message::PullQuery { id: 6, container: queried, .. } if queried == container
                    ));
                }
                _ => panic!("expected looped-back query"),
            }
            // We still expect ourselves to answer (or time out).
            assert!(harness.sender.next_timeout().is_some());
        });
    }

    #[test]
    fn test_benched_peer_short_circuits() {
        let executor = deterministic::Runner::seeded(0);
        executor.start(|context| async move {
            let mut harness = setup(&context, true).await;
            let other = harness.other.clone();

            // Three timed-out requests bench the peer.
            for request in 0..3u32 {
                harness
                    .sender
                    .send_get(other.clone(), request, hash(&request.to_be_bytes()))
                    .await;
                context.sleep(Duration::from_secs(5)).await;
                let fired = harness.sender.expired();
                assert_eq!(fired.len(), 1);
            }

            // The next request never touches the network: an immediate
            // local failure, no timeout registered.
            harness.sender.send_get(other.clone(), 9, hash(b"benched")).await;
            expect_failed(&mut harness.loopback, &other, RequestKind::Get);
            assert!(harness.sender.next_timeout().is_none());
            assert_eq!(harness.sender.len_benched(), 1);

            // The bench expires on schedule.
            context.sleep(Duration::from_secs(31)).await;
            assert_eq!(harness.sender.len_benched(), 0);
        });
    }

    #[test]
    fn test_response_cancels_timeout() {
        let executor = deterministic::Runner::seeded(0);
        executor.start(|context| async move {
            let mut harness = setup(&context, true).await;
            let other = harness.other.clone();

            harness.sender.send_get(other.clone(), 2, hash(b"x")).await;
            assert!(harness.sender.next_timeout().is_some());
            assert_eq!(
                harness.sender.on_response(&other, 2),
                Some(RequestKind::Get)
            );
            assert!(harness.sender.next_timeout().is_none());
            assert!(harness.sender.expired().is_empty());

            // A second response for the same request is unexpected.
            assert_eq!(harness.sender.on_response(&other, 2), None);
        });
    }
}
