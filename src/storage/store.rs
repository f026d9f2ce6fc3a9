use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::model::NodeId;

/// Byte-addressable key-value store holding the overflow records, keyed by
/// node id. Implementations live outside the core; the only requirements are
/// that `put` is durable by the time it returns (or fails loudly) and that
/// concurrent `put` on distinct keys is safe. The eviction scheduler
/// guarantees single-writer semantics per id.
pub trait OverflowStore: Send + Sync {
    fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()>;

    fn get(&self, id: NodeId) -> Result<Option<Vec<u8>>>;

    /// Not used on the eviction path; provided for graph-level deletes.
    fn delete(&self, id: NodeId) -> Result<()>;
}

/// Heap-backed store. The zero-setup default, and what the test suite runs
/// against.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<NodeId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl OverflowStore for MemoryStore {
    fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        self.records.lock().insert(id, bytes.to_vec());
        Ok(())
    }

    fn get(&self, id: NodeId) -> Result<Option<Vec<u8>>> {
        Ok(self.records.lock().get(&id).cloned())
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.records.lock().remove(&id);
        Ok(())
    }
}
