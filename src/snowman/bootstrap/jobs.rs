use crate::Block;
use commonware_cryptography::Digest;
use std::collections::{HashMap, VecDeque};

/// Dependency-ordered queue of blocked jobs.
///
/// Each job carries a fetched container and runs once its parent is
/// either locally accepted (known at push time) or has been executed in
/// this run. A child is never handed out before its parent.
pub struct Jobs<D: Digest> {
    jobs: HashMap<D, Block<D>>,
    /// parent id -> children waiting on it.
    waiting: HashMap<D, Vec<D>>,
    runnable: VecDeque<D>,
}

impl<D: Digest> Jobs<D> {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            waiting: HashMap::new(),
            runnable: VecDeque::new(),
        }
    }

    pub fn contains(&self, id: &D) -> bool {
        self.jobs.contains_key(id)
    }

    /// Queue a job. `parent_ready` marks jobs whose parent is already
    /// accepted locally.
    pub fn push(&mut self, block: Block<D>, parent_ready: bool) {
        let id = block.id;
        if self.jobs.contains_key(&id) {
            return;
        }
        let parent = block.parent;
        self.jobs.insert(id, block);
        if parent_ready {
            self.runnable.push_back(id);
        } else {
            self.waiting.entry(parent).or_default().push(id);
        }
    }

    /// Mark `parent` executed, promoting any jobs waiting on it.
    pub fn ready(&mut self, parent: &D) {
        let Some(children) = self.waiting.remove(parent) else {
            return;
        };
        for child in children {
            if self.jobs.contains_key(&child) {
                self.runnable.push_back(child);
            }
        }
    }

    /// Take the next runnable job.
    pub fn pop_runnable(&mut self) -> Option<Block<D>> {
        let id = self.runnable.pop_front()?;
        self.jobs.remove(&id)
    }

    /// Total queued jobs (runnable or blocked).
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.waiting.clear();
        self.runnable.clear();
    }
}
