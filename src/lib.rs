//! Order opaque blocks into a single accepted chain with repeated
//! random sampling.
//!
//! This crate implements the consensus core of a blockchain node: a
//! [snowman] engine that accepts a stream of candidate blocks from a
//! virtual machine, polls sampled committees of validators about their
//! preferences, and converges on one accepted chain. The VM, the wire
//! transport, and persistence are all external collaborators reached
//! through the traits defined here and through [commonware_p2p]
//! channels.
//!
//! # Status
//!
//! `snowman` is **ALPHA** software. Developers should expect breaking
//! changes and occasional instability.

pub mod snowman;

use bytes::Bytes;
use commonware_cryptography::{Digest, PublicKey};
use rand::Rng;
use std::future::Future;

/// The lifecycle of a block, as tracked by the VM.
///
/// Transitions are monotonic and one-shot:
/// `Unknown -> Processing -> (Accepted | Rejected)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The block's bytes have never been seen locally.
    Unknown,
    /// The block is known locally but not yet decided.
    Processing,
    /// The block is part of the accepted chain.
    Accepted,
    /// The block conflicts with an accepted block.
    Rejected,
}

impl Status {
    /// Whether the block has been accepted or rejected.
    pub fn decided(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }

    /// Whether the block's bytes are available locally.
    pub fn fetched(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Metadata the VM exposes for a block it knows about.
///
/// Consensus never interprets `bytes`; it only tracks identity, ancestry,
/// and (for oracle blocks) the fact that a fixed set of option children
/// must be issued together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block<D: Digest> {
    /// Unique identifier of the block.
    pub id: D,
    /// Identifier of the block's parent.
    pub parent: D,
    /// Distance from genesis.
    pub height: u64,
    /// Opaque serialization, sufficient for any peer to reconstruct the
    /// block via [Vm::parse_block].
    pub bytes: Bytes,
    /// Whether the block deterministically exposes option children
    /// (available via [Vm::options]) that must be issued together.
    pub oracle: bool,
}

/// Notifications pushed from the VM into the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmEvent {
    /// The mempool has transactions; the engine should ask the VM to
    /// build a block on the preferred tip.
    PendingTxs,
}

/// The virtual machine that produces, verifies, and executes blocks.
///
/// All methods are invoked from the single chain worker, so implementors
/// observe calls in a total order. Calls are expected to be bounded in
/// duration; long work is the VM's responsibility to chunk.
pub trait Vm: Clone + Send + 'static {
    /// Identifier type for blocks.
    type Digest: Digest;

    /// Error surfaced by `accept`; fatal for the chain.
    type Error: std::error::Error + Send + 'static;

    /// Build a block extending the current preference.
    ///
    /// Returns `None` if nothing can be built right now.
    fn build_block(&mut self) -> impl Future<Output = Option<Block<Self::Digest>>> + Send;

    /// Parse a block from its serialization, persisting the bytes.
    ///
    /// Parsing yields a block with status [Status::Processing] by
    /// convention (unless the block was already decided locally).
    fn parse_block(
        &mut self,
        bytes: Bytes,
    ) -> impl Future<Output = Option<Block<Self::Digest>>> + Send;

    /// Fetch a locally-known block by id, from memory or persistence.
    fn get_block(
        &mut self,
        id: &Self::Digest,
    ) -> impl Future<Output = Option<Block<Self::Digest>>> + Send;

    /// Current status of a block.
    fn status(&mut self, id: &Self::Digest) -> impl Future<Output = Status> + Send;

    /// Option children of an oracle block (empty for non-oracle blocks).
    fn options(
        &mut self,
        id: &Self::Digest,
    ) -> impl Future<Output = Vec<Block<Self::Digest>>> + Send;

    /// Verify a block against its (already issued) parent.
    ///
    /// Verification is deterministic: a failure is never retried.
    fn verify(&mut self, id: &Self::Digest) -> impl Future<Output = bool> + Send;

    /// Mark a block accepted and execute it. Errors are fatal.
    fn accept(
        &mut self,
        id: &Self::Digest,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Mark a block rejected.
    fn reject(&mut self, id: &Self::Digest) -> impl Future<Output = ()> + Send;

    /// Id of the most recently accepted block.
    fn last_accepted(&mut self) -> impl Future<Output = Self::Digest> + Send;

    /// Inform the VM which tip new blocks should extend.
    fn set_preference(&mut self, id: Self::Digest) -> impl Future<Output = ()> + Send;

    /// Handle an opaque application request from a peer, returning the
    /// response bytes (or `None` to drop the request).
    fn app_request(
        &mut self,
        payload: Bytes,
    ) -> impl Future<Output = Option<Bytes>> + Send;

    /// Handle an opaque application response (or gossip) from a peer.
    fn app_response(&mut self, payload: Bytes) -> impl Future<Output = ()> + Send;
}

/// The validator set for a chain, with stake weights.
///
/// The set is fixed for the lifetime of an engine instance; restarts pick
/// up membership changes.
pub trait Supervisor: Clone + Send + Sync + 'static {
    /// Identity type for validators.
    type PublicKey: PublicKey;

    /// All current validators.
    fn participants(&self) -> &[Self::PublicKey];

    /// Stake weight of a validator, if it is one.
    fn weight(&self, candidate: &Self::PublicKey) -> Option<u64>;

    /// Total stake weight of the set.
    fn total_weight(&self) -> u64;

    /// Sample `k` distinct validators, weighted by stake.
    ///
    /// Returns fewer than `k` validators only if the set is smaller
    /// than `k`.
    fn sample<R: Rng>(&self, rng: &mut R, k: usize) -> Vec<Self::PublicKey>;
}
