use super::{
    ingress::{Event, Loopback, Mailbox},
    queue::{FairQueue, Meter},
};
use crate::{
    snowman::{
        bootstrap::Bootstrapper, config::Config, metrics::Metrics, sender::Sender,
        transitive::Transitive,
    },
    Supervisor, Vm, VmEvent,
};
use commonware_cryptography::{Digest, PublicKey};
use commonware_macros::select;
use commonware_p2p::{
    utils::codec::wrap, Receiver as NetReceiver, Sender as NetSender,
};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::mpsc,
    future::{self, Either},
    StreamExt,
};
use rand::Rng;
use std::{
    marker::PhantomData,
    time::{Duration, UNIX_EPOCH},
};
use tracing::{debug, error, info};

/// The single chain worker.
///
/// Owns the inbound queue and the engine core; every engine method runs
/// on this task, so the actor's run loop is the chain lock.
pub struct Actor<
    E: Clock + Rng + Spawner + RuntimeMetrics,
    P: PublicKey,
    D: Digest,
    V: Vm<Digest = D>,
    Z: Supervisor<PublicKey = P>,
    S: NetSender<PublicKey = P>,
    R: NetReceiver<PublicKey = P>,
> {
    context: E,
    cfg: Config<P, D, V, Z>,
    notifications: Option<mpsc::Receiver<VmEvent>>,

    mailbox: Mailbox<P, D>,
    receiver: mpsc::Receiver<Event<P, D>>,
    loopback: Loopback<P, D>,
    loopback_receiver: mpsc::UnboundedReceiver<Event<P, D>>,

    queue: FairQueue<P, Event<P, D>>,
    meter: Meter<P>,
    metrics: Metrics,

    _s: PhantomData<S>,
    _r: PhantomData<R>,
}

impl<
        E: Clock + Rng + Spawner + RuntimeMetrics,
        P: PublicKey,
        D: Digest,
        V: Vm<Digest = D>,
        Z: Supervisor<PublicKey = P>,
        S: NetSender<PublicKey = P>,
        R: NetReceiver<PublicKey = P>,
    > Actor<E, P, D, V, Z, S, R>
{
    /// Create the worker and a mailbox for pushing events to it.
    pub fn new(
        context: E,
        cfg: Config<P, D, V, Z>,
        notifications: mpsc::Receiver<VmEvent>,
    ) -> (Self, Mailbox<P, D>) {
        cfg.assert();
        let metrics = Metrics::init(&context);
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(sender);
        let (loopback_sender, loopback_receiver) = mpsc::unbounded();
        let loopback = Loopback::new(loopback_sender);
        let meter = Meter::new(cfg.cpu_halflife);
        (
            Self {
                context,
                cfg,
                notifications: Some(notifications),
                mailbox: mailbox.clone(),
                receiver,
                loopback,
                loopback_receiver,
                queue: FairQueue::new(),
                meter,
                metrics,
                _s: PhantomData,
                _r: PhantomData,
            },
            mailbox,
        )
    }

    pub fn start(mut self, network: (S, R)) -> Handle<()> {
        self.context.spawn_ref()(self.run(network))
    }

    async fn run(mut self, network: (S, R)) {
        let (net_sender, net_receiver) = wrap((), network.0, network.1);

        // Pump decoded network messages into the mailbox.
        {
            let mut mailbox = self.mailbox.clone();
            self.context
                .with_label("ingress")
                .spawn(move |_| async move {
                    let mut receiver = net_receiver;
                    loop {
                        match receiver.recv().await {
                            Ok((peer, Ok(message))) => mailbox.inbound(peer, message).await,
                            Ok((peer, Err(err))) => {
                                debug!(?peer, ?err, "failed to decode message");
                            }
                            Err(err) => {
                                debug!(?err, "network closed");
                                return;
                            }
                        }
                    }
                });
        }

        // Pump VM notifications into the mailbox, tagged as ours.
        if let Some(mut notifications) = self.notifications.take() {
            let mut mailbox = self.mailbox.clone();
            self.context
                .with_label("notifier")
                .spawn(move |_| async move {
                    while let Some(event) = notifications.next().await {
                        mailbox.vm(event).await;
                    }
                    debug!("vm notifications closed");
                });
        }

        // Assemble the engine core around the wrapped network sender.
        let sender = Sender::new(
            self.context.clone(),
            self.cfg.me.clone(),
            net_sender,
            self.loopback.clone(),
            self.cfg.timeout,
            self.cfg.benchlist,
            self.metrics.clone(),
        );
        let bootstrap = Bootstrapper::new(
            self.cfg.beacons.clone(),
            self.cfg.bootstrap_alpha,
            self.cfg.bootstrap_max_attempts,
            self.cfg.bootstrap_restart_budget,
            self.metrics.clone(),
        );
        let mut engine = Transitive::new(
            self.context.clone(),
            self.cfg.vm.clone(),
            self.cfg.supervisor.clone(),
            sender,
            self.cfg.params,
            bootstrap,
            self.cfg.max_ancestors,
            self.cfg.max_ancestors_bytes,
            self.cfg.max_time_fetching_ancestors,
            self.cfg.gossip_sample,
            self.metrics.clone(),
        );
        if let Err(err) = engine.start().await {
            error!(?err, "failed to start engine");
            return;
        }

        let mut shutdown = self.context.stopped();
        let mut next_gossip = self
            .cfg
            .gossip_interval
            .map(|interval| self.context.current() + interval);
        loop {
            // Move everything ready onto the fair queue: the worker's
            // own continuations first, then pumped events.
            while let Ok(Some(event)) = self.loopback_receiver.try_next() {
                self.enqueue(event);
            }
            while let Ok(Some(event)) = self.receiver.try_next() {
                self.enqueue(event);
            }

            // Serve the fairest queued peer.
            let now = self.context.current();
            if let Some((peer, event)) = self.queue.pop(&self.meter, now) {
                if let Err(err) = self.dispatch(&mut engine, peer, event).await {
                    error!(?err, "chain shutting down");
                    engine.shutdown().await;
                    return;
                }
                continue;
            }

            // Idle: synthesize failures for requests that timed out.
            let expired = engine.expired();
            if !expired.is_empty() {
                for (peer, id, kind) in expired {
                    self.loopback.failed(peer, id, kind);
                }
                continue;
            }

            // Nothing queued: wait for an event or the next deadline.
            let deadline = match engine.next_timeout() {
                Some(deadline) => Either::Left(self.context.sleep_until(deadline)),
                None => Either::Right(future::pending()),
            };
            let gossip = match next_gossip {
                Some(at) => Either::Left(self.context.sleep_until(at)),
                None => Either::Right(future::pending()),
            };
            select! {
                _ = &mut shutdown => {
                    info!("shutdown");
                    engine.shutdown().await;
                    return;
                },
                event = self.loopback_receiver.next() => {
                    let Some(event) = event else {
                        debug!("loopback closed");
                        return;
                    };
                    self.enqueue(event);
                },
                event = self.receiver.next() => {
                    let Some(event) = event else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.enqueue(event);
                },
                _ = gossip => {
                    engine.gossip().await;
                    next_gossip = self
                        .cfg
                        .gossip_interval
                        .map(|interval| self.context.current() + interval);
                },
                _ = deadline => {},
            }
        }
    }

    fn enqueue(&mut self, event: Event<P, D>) {
        let peer = match &event {
            Event::Inbound { peer, .. } => peer.clone(),
            Event::Failed { peer, .. } => peer.clone(),
            Event::Vm(_) => self.cfg.me.clone(),
        };
        self.queue.push(peer, event);
    }

    async fn dispatch(
        &mut self,
        engine: &mut Transitive<E, P, D, V, Z, S>,
        peer: P,
        event: Event<P, D>,
    ) -> Result<(), crate::snowman::types::Error> {
        let start = self.context.current();

        // Requests whose deadline already passed are not worth serving.
        if let Event::Inbound { message, .. } = &event {
            if let Some(deadline) = message.deadline() {
                if start > UNIX_EPOCH + Duration::from_secs(deadline) {
                    debug!(?peer, op = message.op(), "dropping expired message");
                    self.metrics.expired.inc();
                    return Ok(());
                }
            }
        }

        match event {
            Event::Inbound { peer, message } => engine.handle(peer, message).await?,
            Event::Failed { peer, id, kind } => engine.handle_failure(peer, id, kind).await?,
            Event::Vm(event) => engine.notify(event).await?,
        }

        let end = self.context.current();
        let spent = end.duration_since(start).unwrap_or_default();
        self.meter.charge(&peer, end, spent);
        self.metrics.dispatch_duration.observe(spent.as_secs_f64());
        Ok(())
    }
}
