mod support;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spillway::{CancelToken, GraphError, HandleTable, ManagerConfig, ReferenceManager};
use support::{resident_handle, SpyStore};

fn pinned_round(
    store: &Arc<SpyStore>,
    config: ManagerConfig,
) -> (Arc<ReferenceManager>, Arc<HandleTable>) {
    let table = Arc::new(HandleTable::new());
    let manager = Arc::new(
        ReferenceManager::new(Arc::clone(store) as Arc<dyn spillway::OverflowStore>, Arc::clone(&table), config)
            .expect("spawn manager"),
    );
    manager.register(resident_handle(1)).expect("register");
    store.hold_puts();
    manager.on_heap_above_threshold();
    (manager, table)
}

#[test]
fn backpressure_blocks_until_the_round_completes() {
    let store = SpyStore::new();
    let (manager, _table) = pinned_round(
        &store,
        ManagerConfig {
            worker_count: 1,
            ..ManagerConfig::default()
        },
    );

    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(&manager);
    thread::spawn(move || {
        tx.send(waiter.apply_backpressure()).unwrap();
    });

    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "waiter returned while the round was still in flight"
    );

    store.release_puts();
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("waiter released after round completion");
    assert!(result.is_ok());
    assert_eq!(manager.stats().rounds_completed, 1);
}

#[test]
fn backpressure_is_a_noop_while_idle() {
    let store = SpyStore::new();
    let manager = ReferenceManager::new(
        Arc::clone(&store) as Arc<dyn spillway::OverflowStore>,
        Arc::new(HandleTable::new()),
        ManagerConfig::default(),
    )
    .expect("spawn manager");

    let started = Instant::now();
    manager.apply_backpressure().expect("no round in flight");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn bounded_backpressure_times_out() {
    let store = SpyStore::new();
    let (manager, _table) = pinned_round(
        &store,
        ManagerConfig {
            worker_count: 1,
            ..ManagerConfig::bounded_backpressure(Duration::from_millis(50))
        },
    );

    assert!(matches!(
        manager.apply_backpressure(),
        Err(GraphError::TimedOut)
    ));

    store.release_puts();
    manager.apply_backpressure().expect("round completes");
}

#[test]
fn cancellation_interrupts_the_wait() {
    let store = SpyStore::new();
    let (manager, _table) = pinned_round(
        &store,
        ManagerConfig {
            worker_count: 1,
            ..ManagerConfig::default()
        },
    );

    let token = CancelToken::new();
    let canceller = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    assert!(matches!(
        manager.apply_backpressure_interruptible(&token),
        Err(GraphError::Cancelled)
    ));

    store.release_puts();
    manager.apply_backpressure().expect("round completes");
}

#[test]
fn drain_all_waits_out_a_concurrent_round() {
    let store = SpyStore::new();
    let (manager, table) = pinned_round(
        &store,
        ManagerConfig {
            worker_count: 1,
            ..ManagerConfig::default()
        },
    );
    manager.register(resident_handle(2)).expect("register");

    let (tx, rx) = mpsc::channel();
    let drainer = Arc::clone(&manager);
    thread::spawn(move || {
        tx.send(drainer.drain_all()).unwrap();
    });

    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "drain returned while a round held a handle"
    );

    store.release_puts();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("drain completed")
        .expect("drain succeeded");
    assert!(table.is_empty());
    assert_eq!(store.record_count(), 2);
}
