use super::{
    actors::handler,
    config::Config,
};
use crate::{Supervisor, Vm, VmEvent};
use commonware_cryptography::{Digest, PublicKey};
use commonware_p2p::{Receiver, Sender};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::channel::mpsc;
use rand::Rng;

/// A snowman consensus instance for one chain.
///
/// Wires the chain worker to a dedicated p2p channel. The VM pushes
/// notifications through the channel handed to [Engine::new]; peers
/// reach the engine through the network.
pub struct Engine<
    E: Clock + Rng + Spawner + Metrics,
    P: PublicKey,
    D: Digest,
    V: Vm<Digest = D>,
    Z: Supervisor<PublicKey = P>,
    S: Sender<PublicKey = P>,
    R: Receiver<PublicKey = P>,
> {
    actor: handler::Actor<E, P, D, V, Z, S, R>,
}

impl<
        E: Clock + Rng + Spawner + Metrics,
        P: PublicKey,
        D: Digest,
        V: Vm<Digest = D>,
        Z: Supervisor<PublicKey = P>,
        S: Sender<PublicKey = P>,
        R: Receiver<PublicKey = P>,
    > Engine<E, P, D, V, Z, S, R>
{
    /// Create an engine. `notifications` carries VM events (e.g.
    /// pending transactions) into the chain worker.
    ///
    /// The returned mailbox can inject inbound events directly; the
    /// network pump uses the same path internally.
    pub fn new(
        context: E,
        cfg: Config<P, D, V, Z>,
        notifications: mpsc::Receiver<VmEvent>,
    ) -> (Self, handler::Mailbox<P, D>) {
        let (actor, mailbox) =
            handler::Actor::new(context.with_label("handler"), cfg, notifications);
        (Self { actor }, mailbox)
    }

    /// Start the chain worker on the given network channel. The engine
    /// runs until an unrecoverable error or shutdown.
    pub fn start(self, network: (S, R)) -> Handle<()> {
        self.actor.start(network)
    }
}
