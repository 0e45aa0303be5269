use crate::{Block, Status, Vm};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::Digest;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Fault injected by a scripted accept failure.
#[derive(Debug, Error)]
#[error("application fault: {0}")]
pub struct Fault(pub String);

/// Self-describing mock serialization of a block.
struct Frame<D: Digest> {
    id: D,
    parent: D,
    height: u64,
    oracle: bool,
}

impl<D: Digest> Write for Frame<D> {
    fn write(&self, buf: &mut impl BufMut) {
        self.id.write(buf);
        self.parent.write(buf);
        self.height.write(buf);
        buf.put_u8(self.oracle as u8);
    }
}

impl<D: Digest> EncodeSize for Frame<D> {
    fn encode_size(&self) -> usize {
        self.id.encode_size() + self.parent.encode_size() + self.height.encode_size() + 1
    }
}

impl<D: Digest> Read for Frame<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let id = D::read(buf)?;
        let parent = D::read(buf)?;
        let height = u64::read(buf)?;
        let oracle = u8::read(buf)? != 0;
        Ok(Self {
            id,
            parent,
            height,
            oracle,
        })
    }
}

/// Serialize a block the mock way (the engine treats this as opaque).
pub fn encode<D: Digest>(id: D, parent: D, height: u64, oracle: bool) -> Bytes {
    Frame {
        id,
        parent,
        height,
        oracle,
    }
    .encode()
    .into()
}

struct State<D: Digest> {
    blocks: HashMap<D, Block<D>>,
    statuses: HashMap<D, Status>,
    options: HashMap<D, Vec<D>>,
    invalid: HashSet<D>,
    fail_accept: HashSet<D>,
    buildable: VecDeque<Block<D>>,
    last_accepted: D,
    preference: D,
    accepted_order: Vec<D>,
    app_messages: Vec<Bytes>,
}

/// An in-memory VM with scriptable behavior.
///
/// Blocks are self-describing, so any instance can parse bytes produced
/// by another. Clones share state (the engine owns one clone, the test
/// another).
#[derive(Clone)]
pub struct Application<D: Digest> {
    state: Arc<Mutex<State<D>>>,
}

impl<D: Digest> Application<D> {
    /// Create a VM whose chain starts at (accepted) `genesis`.
    pub fn new(genesis: Block<D>) -> Self {
        let mut blocks = HashMap::new();
        let mut statuses = HashMap::new();
        statuses.insert(genesis.id, Status::Accepted);
        let id = genesis.id;
        blocks.insert(id, genesis);
        Self {
            state: Arc::new(Mutex::new(State {
                blocks,
                statuses,
                options: HashMap::new(),
                invalid: HashSet::new(),
                fail_accept: HashSet::new(),
                buildable: VecDeque::new(),
                last_accepted: id,
                preference: id,
                accepted_order: vec![id],
                app_messages: Vec::new(),
            })),
        }
    }

    /// Make a block known locally with status [Status::Processing].
    pub fn deliver(&self, block: Block<D>) {
        let mut state = self.state.lock().unwrap();
        state.statuses.entry(block.id).or_insert(Status::Processing);
        state.blocks.insert(block.id, block);
    }

    /// Make a block known locally and mark it accepted (seeding history
    /// for bootstrap scenarios).
    pub fn deliver_accepted(&self, block: Block<D>) {
        let mut state = self.state.lock().unwrap();
        state.statuses.insert(block.id, Status::Accepted);
        state.last_accepted = block.id;
        state.accepted_order.push(block.id);
        state.blocks.insert(block.id, block);
    }

    /// Queue a block for the next `build_block`.
    pub fn buildable(&self, block: Block<D>) {
        self.state.lock().unwrap().buildable.push_back(block);
    }

    /// Script `verify` to fail for `id`.
    pub fn fail_verify(&self, id: D) {
        self.state.lock().unwrap().invalid.insert(id);
    }

    /// Script `accept` to fail for `id`.
    pub fn fail_accept(&self, id: D) {
        self.state.lock().unwrap().fail_accept.insert(id);
    }

    /// Register the options of an oracle block (also making them known
    /// locally).
    pub fn set_options(&self, id: D, options: Vec<Block<D>>) {
        let mut state = self.state.lock().unwrap();
        state.options.insert(id, options.iter().map(|block| block.id).collect());
        for option in options {
            state.statuses.entry(option.id).or_insert(Status::Processing);
            state.blocks.insert(option.id, option);
        }
    }

    /// Accepted ids, in acceptance order (genesis first).
    pub fn accepted_order(&self) -> Vec<D> {
        self.state.lock().unwrap().accepted_order.clone()
    }

    pub fn current_status(&self, id: &D) -> Status {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(id)
            .copied()
            .unwrap_or(Status::Unknown)
    }

    pub fn current_preference(&self) -> D {
        self.state.lock().unwrap().preference
    }

    pub fn current_last_accepted(&self) -> D {
        self.state.lock().unwrap().last_accepted
    }

    /// Opaque app payloads received so far.
    pub fn app_messages(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().app_messages.clone()
    }
}

impl<D: Digest> Vm for Application<D> {
    type Digest = D;
    type Error = Fault;

    async fn build_block(&mut self) -> Option<Block<D>> {
        let mut state = self.state.lock().unwrap();
        let block = state.buildable.pop_front()?;
        state.statuses.entry(block.id).or_insert(Status::Processing);
        state.blocks.insert(block.id, block.clone());
        Some(block)
    }

    async fn parse_block(&mut self, bytes: Bytes) -> Option<Block<D>> {
        let frame = Frame::<D>::read_cfg(&mut bytes.clone(), &()).ok()?;
        let block = Block {
            id: frame.id,
            parent: frame.parent,
            height: frame.height,
            bytes,
            oracle: frame.oracle,
        };
        let mut state = self.state.lock().unwrap();
        state.statuses.entry(block.id).or_insert(Status::Processing);
        state.blocks.insert(block.id, block.clone());
        Some(block)
    }

    async fn get_block(&mut self, id: &D) -> Option<Block<D>> {
        self.state.lock().unwrap().blocks.get(id).cloned()
    }

    async fn status(&mut self, id: &D) -> Status {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(id)
            .copied()
            .unwrap_or(Status::Unknown)
    }

    async fn options(&mut self, id: &D) -> Vec<Block<D>> {
        let state = self.state.lock().unwrap();
        let Some(options) = state.options.get(id) else {
            return Vec::new();
        };
        options
            .iter()
            .filter_map(|option| state.blocks.get(option).cloned())
            .collect()
    }

    async fn verify(&mut self, id: &D) -> bool {
        !self.state.lock().unwrap().invalid.contains(id)
    }

    async fn accept(&mut self, id: &D) -> Result<(), Fault> {
        let mut state = self.state.lock().unwrap();
        if state.fail_accept.contains(id) {
            return Err(Fault(format!("scripted accept failure for {id:?}")));
        }
        state.statuses.insert(*id, Status::Accepted);
        state.last_accepted = *id;
        state.accepted_order.push(*id);
        Ok(())
    }

    async fn reject(&mut self, id: &D) {
        self.state.lock().unwrap().statuses.insert(*id, Status::Rejected);
    }

    async fn last_accepted(&mut self) -> D {
        self.state.lock().unwrap().last_accepted
    }

    async fn set_preference(&mut self, id: D) {
        self.state.lock().unwrap().preference = id;
    }

    async fn app_request(&mut self, payload: Bytes) -> Option<Bytes> {
        self.state.lock().unwrap().app_messages.push(payload.clone());
        Some(payload)
    }

    async fn app_response(&mut self, payload: Bytes) {
        self.state.lock().unwrap().app_messages.push(payload);
    }
}
