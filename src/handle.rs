use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::EvictionMode;
use crate::error::{GraphError, Result};
use crate::model::{Label, NodeBody, NodeId};
use crate::storage::codec::{encode_node, NodeDecoder};
use crate::storage::store::OverflowStore;
use crate::table::HandleTable;

/// Stable, lightweight identity of a node. The handle outlives eviction: when
/// the body is absent the persisted bytes are authoritative, when present the
/// in-memory body is. Dereferencing an evicted handle rehydrates it through a
/// [`NodeLoader`].
pub struct NodeHandle {
    id: NodeId,
    label: Label,
    body: RwLock<Option<NodeBody>>,
    dirty: AtomicBool,
}

impl NodeHandle {
    /// Evicted handle: identity only. Used when rebuilding from storage.
    pub fn new(id: NodeId, label: impl Into<Label>) -> Arc<Self> {
        Arc::new(Self {
            id,
            label: label.into(),
            body: RwLock::new(None),
            dirty: AtomicBool::new(false),
        })
    }

    /// Freshly allocated node: body resident, dirty until the first
    /// write-back.
    pub fn with_body(body: NodeBody) -> Arc<Self> {
        Arc::new(Self {
            id: body.id,
            label: body.label.clone(),
            body: RwLock::new(Some(body)),
            dirty: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a body is currently attached. Racy by design; only suitable
    /// for skip logic.
    pub fn is_set(&self) -> bool {
        self.body.read().is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Records that the body diverged from the persisted bytes. Idempotent.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns the resident body, loading it from the overflow store first if
    /// it was evicted. A successful load re-registers the handle with the
    /// handle table.
    pub fn get_or_load(
        self: &Arc<Self>,
        loader: &NodeLoader,
    ) -> Result<MappedRwLockReadGuard<'_, NodeBody>> {
        {
            let guard = self.body.read();
            if guard.is_some() {
                return Ok(RwLockReadGuard::map(guard, |slot| {
                    slot.as_ref().expect("presence checked under the read lock")
                }));
            }
        }

        let mut slot = self.body.write();
        if slot.is_none() {
            self.load_into(&mut slot, loader)?;
            loader.table.register(Arc::clone(self));
        }
        let guard = RwLockWriteGuard::downgrade(slot);
        Ok(RwLockReadGuard::map(guard, |slot| {
            slot.as_ref().expect("body just installed")
        }))
    }

    /// Runs `f` over a mutable view of the body, loading it first if needed,
    /// and marks the handle dirty. The write lock spans the closure, so the
    /// mutation cannot interleave with an eviction worker.
    pub fn with_body_mut<T>(
        self: &Arc<Self>,
        loader: &NodeLoader,
        f: impl FnOnce(&mut NodeBody) -> T,
    ) -> Result<T> {
        let mut slot = self.body.write();
        if slot.is_none() {
            self.load_into(&mut slot, loader)?;
            loader.table.register(Arc::clone(self));
        }
        let body = slot.as_mut().expect("body just installed");
        let out = f(body);
        self.dirty.store(true, Ordering::Release);
        Ok(out)
    }

    fn load_into(&self, slot: &mut Option<NodeBody>, loader: &NodeLoader) -> Result<()> {
        let bytes = loader
            .store
            .get(self.id)
            .map_err(|err| GraphError::load_failed(self.id, err))?
            .ok_or_else(|| {
                GraphError::load_failed(
                    self.id,
                    GraphError::Persistence(format!("no overflow record for node {}", self.id)),
                )
            })?;
        let body = loader
            .decoder
            .decode(&bytes)
            .map_err(|err| GraphError::load_failed(self.id, err))?;
        *slot = Some(body);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Writes the body back (always in conservative mode, only when dirty
    /// otherwise) and detaches it. Called exclusively by eviction workers,
    /// which own the handle after it was drained from the table. Returns
    /// whether a body was actually cleared.
    pub(crate) fn clear(&self, store: &dyn OverflowStore, mode: EvictionMode) -> Result<bool> {
        let mut slot = self.body.write();
        let Some(body) = slot.as_ref() else {
            return Ok(false);
        };
        if mode == EvictionMode::Conservative || self.dirty.load(Ordering::Acquire) {
            let bytes = encode_node(body)?;
            store
                .put(self.id, &bytes)
                .map_err(|err| GraphError::Persistence(err.to_string()))?;
            self.dirty.store(false, Ordering::Release);
        }
        *slot = None;
        Ok(true)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("resident", &self.is_set())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Rehydration context: everything a handle needs to restore its body.
pub struct NodeLoader {
    store: Arc<dyn OverflowStore>,
    decoder: Arc<NodeDecoder>,
    table: Arc<HandleTable>,
}

impl NodeLoader {
    pub fn new(
        store: Arc<dyn OverflowStore>,
        decoder: Arc<NodeDecoder>,
        table: Arc<HandleTable>,
    ) -> Self {
        Self {
            store,
            decoder,
            table,
        }
    }

    /// Rebuilds an evicted handle from a stored record, reading only the
    /// `(id, label)` prefix. The startup path for graphs reopened from disk.
    pub fn handle_from_bytes(&self, bytes: &[u8]) -> Result<Arc<NodeHandle>> {
        let (id, label) = self.decoder.decode_ref(bytes)?;
        Ok(NodeHandle::new(id, label))
    }

    pub fn decoder(&self) -> &NodeDecoder {
        &self.decoder
    }

    pub fn table(&self) -> &Arc<HandleTable> {
        &self.table
    }

    pub fn store(&self) -> &Arc<dyn OverflowStore> {
        &self.store
    }
}
