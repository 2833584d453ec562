use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Default number of auditIDs remembered by a webhook listener.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Bounded FIFO set of recently seen auditIDs. Senders retry whole batches
/// after a 429, so replays inside the window must drop silently instead of
/// failing the batch.
pub struct DedupCache {
    capacity: usize,
    inner: Mutex<DedupInner>,
}

struct DedupInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DedupCache {
            capacity,
            inner: Mutex::new(DedupInner {
                seen: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Returns true when the id is new; false when it was already in the
    /// window. Empty ids are never tracked and always pass.
    pub fn insert(&self, id: &str) -> bool {
        if id.is_empty() {
            return true;
        }
        let mut inner = self.inner.lock().expect("dedup cache poisoned");
        if inner.seen.contains(id) {
            return false;
        }
        if inner.order.len() == self.capacity
            && let Some(evicted) = inner.order.pop_front()
        {
            inner.seen.remove(&evicted);
        }
        inner.seen.insert(id.to_string());
        inner.order.push_back(id.to_string());
        true
    }

    /// Forget an id, releasing a claim made by [`insert`](Self::insert) for
    /// an event that was not actually delivered downstream.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().expect("dedup cache poisoned");
        if inner.seen.remove(id)
            && let Some(pos) = inner.order.iter().rposition(|e| e == id)
        {
            inner.order.remove(pos);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup cache poisoned").order.len()
    }
}
