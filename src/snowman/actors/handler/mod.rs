mod actor;
mod ingress;
mod queue;

pub use actor::Actor;
pub use ingress::{Event, Loopback, Mailbox};
pub use queue::{FairQueue, Meter};
