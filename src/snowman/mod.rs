//! Metastable consensus for a linear chain of opaque blocks.
//!
//! `snowman` converges on a single accepted chain by repeatedly polling
//! small, stake-weighted samples of the validator set. Each poll asks a
//! committee for its preferred tip; confidence accumulates along the
//! preferred branch and decays off it. A block whose branch gathers
//! `beta` consecutive alpha-majorities is accepted; its rivals (and
//! their descendants) are rejected.
//!
//! # Architecture
//!
//! All logic runs on one worker per chain (the `Handler`), which owns
//! the engine core. The engine hosts two sub-machines: the
//! `Bootstrapper`, which reconstructs history from a beacon set, and
//! the consensus tree, which orders new blocks once bootstrapping
//! completes. The `Sender` pairs every outbound request with either a
//! registered timeout or a synthesized local failure, so no dependent
//! action waits forever.
//!
//! ```txt
//! +-------------+         +-----------------------------+
//! |             |         |  Handler                    |
//! |     VM      +-------->|  (fair queue, CPU meter)    |
//! |             |<--------+    |                        |
//! +-------------+         |    v                        |
//!                         |  Transitive ---------+      |
//!                         |    |    \            |      |
//!                         |    v     v           v      |          +++++++++++++
//!                         | Consensus Bootstrap Sender  +--------->+   Peers   +
//!                         |             (jobs)   (timeouts,        +           +
//!                         |                       benchlist) <-----+           +
//!                         +-----------------------------+          +++++++++++++
//! ```
//!
//! Inbound messages are drained into a per-peer fair queue; peers that
//! burn more than their share of recent CPU are deprioritized but never
//! starved. Requests whose advertised deadline has passed are dropped
//! unprocessed.
//!
//! # Determinism
//!
//! Nothing in this module reads wall time or randomness outside the
//! runtime context, so entire multi-node networks run reproducibly
//! under `commonware_runtime::deterministic` (see the tests below).

mod actors;
mod bag;
pub mod benchlist;
mod blocked;
mod bootstrap;
mod config;
mod consensus;
mod engine;
mod metrics;
#[cfg(test)]
pub mod mocks;
mod poll;
mod requests;
mod sender;
mod snowball;
pub mod timeout;
mod transitive;
mod types;

pub use actors::handler::Mailbox;
pub use config::Config;
pub use engine::Engine;
pub use types::{
    Error, Message, Parameters, RequestId, RequestKind, GOSSIP_REQUEST_ID, MAX_CONTAINERS_PER_MULTIPUT,
    MAX_CONTAINER_IDS,
};
