use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::{EvictionMode, ManagerConfig};
use crate::error::{GraphError, Result};
use crate::handle::NodeHandle;
use crate::metrics::ManagerStats;
use crate::storage::store::OverflowStore;
use crate::table::HandleTable;

const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Callback interface wired to whatever samples the runtime's memory state.
/// The manager never samples the heap itself.
pub trait HeapListener: Send + Sync {
    fn on_heap_above_threshold(&self);
}

/// Cooperative cancellation flag for backpressure waits.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Clears cold node bodies to the overflow store under heap pressure and
/// applies backpressure to allocators while a clearing round is in flight,
/// so new bodies are not created faster than old ones are written away.
///
/// At most one eviction round runs at a time; a pressure notification that
/// arrives while a round is dispatched is dropped and the monitor is expected
/// to re-sample.
pub struct ReferenceManager {
    config: ManagerConfig,
    shared: Arc<EvictionShared>,
    pool: Mutex<WorkerPool>,
    rounds_dropped: AtomicU64,
    closed: AtomicBool,
}

struct EvictionShared {
    store: Arc<dyn OverflowStore>,
    table: Arc<HandleTable>,
    gate: RoundGate,
    mode: EvictionMode,
    handles_cleared: AtomicU64,
    rounds_completed: AtomicU64,
}

#[derive(Default)]
struct RoundGate {
    state: Mutex<RoundState>,
    completed: Condvar,
}

#[derive(Default)]
struct RoundState {
    rounds_in_flight: usize,
    pending_chunks: usize,
}

enum RoundStart {
    /// A round is already dispatched; the notification is dropped.
    Busy,
    /// Nothing to evict.
    Empty,
    Dispatch(Vec<Vec<Arc<NodeHandle>>>),
}

impl ReferenceManager {
    pub fn new(
        store: Arc<dyn OverflowStore>,
        table: Arc<HandleTable>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let pool = WorkerPool::spawn(config.worker_count.max(1))?;
        Ok(Self {
            shared: Arc::new(EvictionShared {
                store,
                table,
                gate: RoundGate::default(),
                mode: config.eviction_mode,
                handles_cleared: AtomicU64::new(0),
                rounds_completed: AtomicU64::new(0),
            }),
            pool: Mutex::new(pool),
            rounds_dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Makes `handle` eligible for eviction. Called once per materialization:
    /// on allocation, and again on every reload of an evicted handle.
    pub fn register(&self, handle: Arc<NodeHandle>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Shutdown);
        }
        self.shared.table.register(handle);
        Ok(())
    }

    pub fn table(&self) -> &Arc<HandleTable> {
        &self.shared.table
    }

    /// Responds to a heap-pressure notification: drains up to `batch_size`
    /// handles and dispatches them across the worker pool, unless a round is
    /// already in flight.
    pub fn on_heap_above_threshold(&self) {
        self.run_pressure_round();
    }

    /// Blocks the caller while an eviction round is in flight, giving the
    /// writer pipeline a chance to drain before new bodies are admitted.
    /// Returns `TimedOut` if `max_backpressure_wait` is configured and
    /// elapses, `Shutdown` after `close()`.
    pub fn apply_backpressure(&self) -> Result<()> {
        self.backpressure_wait(None)
    }

    /// Like [`apply_backpressure`](Self::apply_backpressure), additionally
    /// returning `Cancelled` as soon as `token` is cancelled.
    pub fn apply_backpressure_interruptible(&self, token: &CancelToken) -> Result<()> {
        self.backpressure_wait(Some(token))
    }

    /// Writes every clearable reference to the overflow store and blocks
    /// until the handle table is empty. Used to persist the graph on
    /// shutdown. Safe against concurrent pressure notifications and
    /// idempotent.
    pub fn drain_all(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Shutdown);
        }
        loop {
            let cleared_before = self.shared.handles_cleared.load(Ordering::Relaxed);
            match self.begin_round(usize::MAX) {
                RoundStart::Busy => self.wait_round_idle(),
                RoundStart::Empty => {
                    if self.shared.table.is_empty() {
                        break;
                    }
                }
                RoundStart::Dispatch(chunks) => {
                    let total: usize = chunks.iter().map(Vec::len).sum();
                    info!(handles = total, "draining all references; this may take some time");
                    self.submit_chunks(chunks);
                    self.wait_round_idle();
                    let cleared_after = self.shared.handles_cleared.load(Ordering::Relaxed);
                    if cleared_after == cleared_before && !self.shared.table.is_empty() {
                        warn!(
                            remaining = self.shared.table.len(),
                            "drain round made no progress; retrying"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Shuts the worker pool down cooperatively: queued chunks finish, no new
    /// work is accepted. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("closing reference manager");
        // wake parked allocators so they observe the shutdown
        self.shared.gate.completed.notify_all();
        self.pool.lock().shutdown();
        Ok(())
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            handles_cleared: self.shared.handles_cleared.load(Ordering::Relaxed),
            rounds_completed: self.shared.rounds_completed.load(Ordering::Relaxed),
            rounds_dropped: self.rounds_dropped.load(Ordering::Relaxed),
            clearable: self.shared.table.len() as u64,
        }
    }

    fn run_pressure_round(&self) {
        if self.closed.load(Ordering::Acquire) {
            warn!("pressure notification after close; ignoring");
            return;
        }
        match self.begin_round(self.config.batch_size) {
            RoundStart::Busy => {
                self.rounds_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("clearing round in flight; will queue more references only after it completes");
            }
            RoundStart::Empty => {
                info!("no clearable references at the moment");
            }
            RoundStart::Dispatch(chunks) => {
                let total: usize = chunks.iter().map(Vec::len).sum();
                info!(
                    handles = total,
                    chunks = chunks.len(),
                    "scheduled references to clear asynchronously"
                );
                self.submit_chunks(chunks);
            }
        }
    }

    /// Drains and partitions a batch while holding the gate, so checking the
    /// in-flight round and claiming the next one is a single atomic step.
    fn begin_round(&self, batch_limit: usize) -> RoundStart {
        let mut state = self.shared.gate.state.lock();
        if state.rounds_in_flight > 0 {
            return RoundStart::Busy;
        }
        let refs = self.shared.table.drain_up_to(batch_limit);
        if refs.is_empty() {
            return RoundStart::Empty;
        }
        let chunks = partition(refs, self.config.worker_count.max(1));
        state.rounds_in_flight = 1;
        state.pending_chunks = chunks.len();
        RoundStart::Dispatch(chunks)
    }

    fn submit_chunks(&self, chunks: Vec<Vec<Arc<NodeHandle>>>) {
        let pool = self.pool.lock();
        for chunk in chunks {
            let shared = Arc::clone(&self.shared);
            if let Err(err) = pool.submit(Box::new(move || clear_chunk(&shared, chunk))) {
                // the chunk never reached the pool; account for it so the
                // round still completes and waiters are released
                error!(error = %err, "failed to submit eviction chunk");
                self.shared.finish_chunk();
            }
        }
    }

    fn backpressure_wait(&self, token: Option<&CancelToken>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Shutdown);
        }
        let deadline = self
            .config
            .max_backpressure_wait
            .map(|limit| Instant::now() + limit);

        let mut state = self.shared.gate.state.lock();
        while state.rounds_in_flight > 0 {
            trace!("waiting until reference clearing completes");
            if self.closed.load(Ordering::Acquire) {
                return Err(GraphError::Shutdown);
            }
            if let Some(token) = token {
                if token.is_cancelled() {
                    return Err(GraphError::Cancelled);
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(GraphError::TimedOut);
                }
            }
            // bounded slices so cancellation, timeout, and shutdown are
            // observed without a dedicated waker
            let _ = self.shared.gate.completed.wait_for(&mut state, WAIT_SLICE);
        }
        trace!("reference clearing completed; continuing");
        Ok(())
    }

    fn wait_round_idle(&self) {
        let mut state = self.shared.gate.state.lock();
        while state.rounds_in_flight > 0 {
            self.shared.gate.completed.wait(&mut state);
        }
    }
}

impl HeapListener for ReferenceManager {
    fn on_heap_above_threshold(&self) {
        self.run_pressure_round();
    }
}

impl Drop for ReferenceManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl EvictionShared {
    /// Decrement-and-notify is atomic with respect to the backpressure wait:
    /// the gate lock is held across both.
    fn finish_chunk(&self) {
        let mut state = self.gate.state.lock();
        state.pending_chunks -= 1;
        if state.pending_chunks == 0 {
            state.rounds_in_flight = 0;
            self.rounds_completed.fetch_add(1, Ordering::Relaxed);
            self.gate.completed.notify_all();
        }
    }
}

/// Completes the chunk on drop, so the round finishes even if a store
/// implementation panics mid-write.
struct ChunkTicket<'a>(&'a EvictionShared);

impl Drop for ChunkTicket<'_> {
    fn drop(&mut self) {
        self.0.finish_chunk();
    }
}

fn clear_chunk(shared: &EvictionShared, chunk: Vec<Arc<NodeHandle>>) {
    let _ticket = ChunkTicket(shared);
    let total = chunk.len();
    let mut cleared = 0usize;
    for handle in chunk {
        match handle.clear(shared.store.as_ref(), shared.mode) {
            Ok(true) => {
                cleared += 1;
                shared.handles_cleared.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(err) => {
                // the handle stays resident and goes back on the table; the
                // next pressure notification retries it
                error!(
                    id = handle.id(),
                    error = %err,
                    "failed to clear reference; keeping it resident"
                );
                shared.table.register(handle);
            }
        }
    }
    debug!(
        cleared,
        total,
        clearable = shared.table.len(),
        "completed clearing of references"
    );
}

fn partition(refs: Vec<Arc<NodeHandle>>, workers: usize) -> Vec<Vec<Arc<NodeHandle>>> {
    let per_worker = refs.len().div_ceil(workers);
    refs.chunks(per_worker).map(|chunk| chunk.to_vec()).collect()
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool draining a shared queue. Tasks are short and block only on
/// the overflow store.
struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(count: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("spillway-evict-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(GraphError::Shutdown);
        };
        sender.send(job).map_err(|_| GraphError::Shutdown)
    }

    fn shutdown(&mut self) {
        // dropping the sender lets workers finish the queued jobs and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("eviction worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stubs(n: u64) -> Vec<Arc<NodeHandle>> {
        (0..n).map(|id| NodeHandle::new(id, "T")).collect()
    }

    #[test]
    fn partition_errs_on_the_larger_side() {
        let chunks = partition(stubs(10), 4);
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn partition_with_more_workers_than_refs() {
        let chunks = partition(stubs(2), 8);
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1]);
    }

    #[test]
    fn partition_single_worker_takes_everything() {
        let chunks = partition(stubs(5), 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5);
    }
}
