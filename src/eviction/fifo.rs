// First-in-first-out policy. Insertion order only; access is a no-op and
// the candidate is always the oldest surviving insert.

use super::{EntryMeta, EvictionPolicy, PolicyKind};
use std::collections::{HashMap, VecDeque};

pub struct FifoPolicy {
    // Generation stamps make queue entries skippable after delete or
    // reinsert without an O(n) removal.
    queue: VecDeque<(Vec<u8>, u64)>,
    index: HashMap<Vec<u8>, u64>,
    generation: u64,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            index: HashMap::new(),
            generation: 0,
        }
    }

    fn skip_stale_front(&mut self) {
        while let Some((key, generation)) = self.queue.front() {
            match self.index.get(key) {
                Some(current) if current == generation => break,
                _ => {
                    self.queue.pop_front();
                }
            }
        }
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Fifo
    }

    fn on_insert(&mut self, key: &[u8], _meta: &EntryMeta) {
        // An overwrite keeps its original queue position.
        if self.index.contains_key(key) {
            return;
        }
        self.generation += 1;
        self.index.insert(key.to_vec(), self.generation);
        self.queue.push_back((key.to_vec(), self.generation));
    }

    fn on_access(&mut self, _key: &[u8], _meta: &EntryMeta) {}

    fn on_delete(&mut self, key: &[u8]) {
        self.index.remove(key);
        self.skip_stale_front();
    }

    fn should_evict(&self, _meta: &EntryMeta, pressure: f64) -> bool {
        pressure > 0.0
    }

    fn next_candidate(&self) -> Option<Vec<u8>> {
        self.queue
            .iter()
            .find(|(key, generation)| self.index.get(key) == Some(generation))
            .map(|(key, _)| key.clone())
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
