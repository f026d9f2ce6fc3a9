use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::NodeHandle;

/// Registry of handles eligible for eviction, drained oldest-first.
///
/// A handle is present at most once per materialization: `register` appends
/// on allocation or reload, `drain_up_to` removes from the head before a
/// worker ever touches the handle. FIFO drain approximates oldest-first
/// eviction without per-handle bookkeeping.
#[derive(Default)]
pub struct HandleTable {
    refs: Mutex<VecDeque<Arc<NodeHandle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<NodeHandle>) {
        self.refs.lock().push_back(handle);
    }

    /// Removes and returns up to `n` handles from the head in insertion order.
    pub fn drain_up_to(&self, n: usize) -> Vec<Arc<NodeHandle>> {
        let mut refs = self.refs.lock();
        let take = n.min(refs.len());
        refs.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }
}
