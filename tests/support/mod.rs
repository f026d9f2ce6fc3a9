#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use spillway::{
    GraphError, HandleTable, ManagerConfig, NodeBody, NodeDecoder, NodeHandle, NodeId, NodeLoader,
    OverflowStore, PropertyValue, RefResolver, ReferenceManager, Result,
};

/// Call-recording store with injectable failures and a gate that holds `put`
/// calls open, used to pin a round in flight.
#[derive(Default)]
pub struct SpyStore {
    records: Mutex<HashMap<NodeId, Vec<u8>>>,
    put_log: Mutex<Vec<NodeId>>,
    get_log: Mutex<Vec<NodeId>>,
    failing_puts: Mutex<HashSet<NodeId>>,
    held: Mutex<bool>,
    released: Condvar,
}

impl SpyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `put` for `id` fails until the set is cleared.
    pub fn fail_put(&self, id: NodeId) {
        self.failing_puts.lock().insert(id);
    }

    /// Blocks every subsequent `put` until [`release_puts`](Self::release_puts).
    pub fn hold_puts(&self) {
        *self.held.lock() = true;
    }

    pub fn release_puts(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.released.notify_all();
    }

    /// Ids passed to `put`, in call order, including failed attempts.
    pub fn puts(&self) -> Vec<NodeId> {
        self.put_log.lock().clone()
    }

    pub fn put_count(&self) -> usize {
        self.put_log.lock().len()
    }

    pub fn gets(&self) -> Vec<NodeId> {
        self.get_log.lock().clone()
    }

    /// Number of records actually stored.
    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.records.lock().contains_key(&id)
    }

    pub fn forget(&self, id: NodeId) {
        self.records.lock().remove(&id);
    }
}

impl OverflowStore for SpyStore {
    fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        self.put_log.lock().push(id);
        {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
        }
        if self.failing_puts.lock().contains(&id) {
            return Err(GraphError::Persistence(format!(
                "injected failure for node {id}"
            )));
        }
        self.records.lock().insert(id, bytes.to_vec());
        Ok(())
    }

    fn get(&self, id: NodeId) -> Result<Option<Vec<u8>>> {
        self.get_log.lock().push(id);
        Ok(self.records.lock().get(&id).cloned())
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.records.lock().remove(&id);
        Ok(())
    }
}

pub fn body(id: NodeId) -> NodeBody {
    let mut body = NodeBody::new(id, "Code");
    body.properties
        .insert("name".into(), PropertyValue::String(format!("node-{id}")));
    body.properties
        .insert("order".into(), PropertyValue::Long(id as i64));
    body.edge_offsets = vec![0, 1];
    body
}

pub fn resident_handle(id: NodeId) -> Arc<NodeHandle> {
    NodeHandle::with_body(body(id))
}

pub fn stub_resolver() -> Arc<dyn RefResolver> {
    Arc::new(|id: NodeId| Ok(NodeHandle::new(id, "stub")))
}

pub fn loader_for(store: Arc<SpyStore>, table: Arc<HandleTable>) -> NodeLoader {
    NodeLoader::new(store, Arc::new(NodeDecoder::new(stub_resolver())), table)
}

/// Evicts `handle` through a throwaway manager, leaving its record in `store`.
pub fn evict(store: Arc<SpyStore>, handle: &Arc<NodeHandle>) {
    let manager = ReferenceManager::new(
        store,
        Arc::new(HandleTable::new()),
        ManagerConfig::default(),
    )
    .expect("spawn manager");
    manager.register(Arc::clone(handle)).expect("register");
    manager.drain_all().expect("evict");
    manager.close().expect("close");
}
