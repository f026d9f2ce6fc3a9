use std::num::NonZeroUsize;
use std::time::Duration;

/// Controls whether a worker writes a node back before detaching its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Always write before clearing. Safe when the upstream cannot reliably
    /// mark nodes dirty.
    Conservative,
    /// Skip the write when the handle is clean; the persisted bytes are
    /// already authoritative.
    DirtyOnly,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum handles evicted per pressure notification.
    pub batch_size: usize,
    /// Size of the worker pool consuming eviction batches.
    pub worker_count: usize,
    /// Cap on how long allocators block in backpressure; unbounded if absent.
    pub max_backpressure_wait: Option<Duration>,
    pub eviction_mode: EvictionMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100_000,
            worker_count: default_worker_count(),
            max_backpressure_wait: None,
            eviction_mode: EvictionMode::Conservative,
        }
    }
}

impl ManagerConfig {
    pub fn dirty_only() -> Self {
        Self {
            eviction_mode: EvictionMode::DirtyOnly,
            ..Self::default()
        }
    }

    pub fn bounded_backpressure(wait: Duration) -> Self {
        Self {
            max_backpressure_wait: Some(wait),
            ..Self::default()
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
