use crate::{
    snowman::types::{Message, RequestId, RequestKind},
    VmEvent,
};
use commonware_cryptography::{Digest, PublicKey};
use futures::{channel::mpsc, SinkExt};
use tracing::debug;

/// Everything that can land on the chain's inbound queue.
pub enum Event<P: PublicKey, D: Digest> {
    /// A message from a peer (or looped back from ourselves).
    Inbound { peer: P, message: Message<D> },
    /// A locally synthesized request failure.
    Failed {
        peer: P,
        id: RequestId,
        kind: RequestKind,
    },
    /// A notification from the VM, attributed to the local node.
    Vm(VmEvent),
}

/// Handle for pushing events onto the handler's queue from other tasks
/// (network pump, VM pump, tests).
#[derive(Clone)]
pub struct Mailbox<P: PublicKey, D: Digest> {
    sender: mpsc::Sender<Event<P, D>>,
}

impl<P: PublicKey, D: Digest> Mailbox<P, D> {
    pub(crate) fn new(sender: mpsc::Sender<Event<P, D>>) -> Self {
        Self { sender }
    }

    pub async fn inbound(&mut self, peer: P, message: Message<D>) {
        if self
            .sender
            .send(Event::Inbound { peer, message })
            .await
            .is_err()
        {
            debug!("mailbox closed");
        }
    }

    pub async fn vm(&mut self, event: VmEvent) {
        if self.sender.send(Event::Vm(event)).await.is_err() {
            debug!("mailbox closed");
        }
    }
}

/// Handle for events the worker synthesizes for itself (self-addressed
/// messages, local failures).
///
/// Unbounded because its producer is the worker: blocking here would
/// deadlock the dispatch loop on its own queue.
#[derive(Clone)]
pub struct Loopback<P: PublicKey, D: Digest> {
    sender: mpsc::UnboundedSender<Event<P, D>>,
}

impl<P: PublicKey, D: Digest> Loopback<P, D> {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Event<P, D>>) -> Self {
        Self { sender }
    }

    pub fn inbound(&mut self, peer: P, message: Message<D>) {
        if self
            .sender
            .unbounded_send(Event::Inbound { peer, message })
            .is_err()
        {
            debug!("loopback closed");
        }
    }

    pub fn failed(&mut self, peer: P, id: RequestId, kind: RequestKind) {
        if self
            .sender
            .unbounded_send(Event::Failed { peer, id, kind })
            .is_err()
        {
            debug!("loopback closed");
        }
    }
}
