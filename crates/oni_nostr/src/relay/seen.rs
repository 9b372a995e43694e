use indexmap::IndexSet;

use crate::NoteId;

/// Ids the pool has already handed to a subscriber. Bounded: past
/// `max_size` the oldest `prune_ratio` share is forgotten.
#[derive(Debug, Clone)]
pub struct SeenEvents {
    ids: IndexSet<NoteId>,
    max_size: usize,
    prune_ratio: f64,
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::new(50_000)
    }
}

impl SeenEvents {
    pub fn new(max_size: usize) -> Self {
        Self {
            ids: IndexSet::new(),
            max_size,
            prune_ratio: 0.4,
        }
    }

    /// Records `id`, returning false if it was already there.
    pub fn insert(&mut self, id: NoteId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }

        if self.ids.len() > self.max_size {
            self.prune();
        }

        true
    }

    pub fn contains(&self, id: &NoteId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    fn prune(&mut self) {
        let evict = ((self.max_size as f64 * self.prune_ratio) as usize)
            .max(1)
            .min(self.ids.len());
        tracing::debug!("pruning {evict} of {} seen event ids", self.ids.len());
        self.ids.drain(..evict);
    }
}
