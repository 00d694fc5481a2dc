//! Rapid subscribe/unsubscribe cycles racing a concurrent writer.

use rtdb_bridge::{
    App, AppOptions, Database, DatabaseReference, DatabaseRegistry, EventKind, ListenerKind,
    MemoryConnector, MemorySyncService,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const URL: &str = "https://churn.example.com";
const NODES: usize = 20;
const CYCLES: usize = 50;

fn setup() -> (DatabaseRegistry, Arc<Database>, Arc<MemorySyncService>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let connector = Arc::new(MemoryConnector::default());
    let registry = DatabaseRegistry::new(connector.clone());
    let app = App::new(
        "churn",
        AppOptions {
            database_url: Some(URL.to_string()),
        },
    );
    let database = registry.get_default_instance(&app).unwrap();
    let service = connector.service_for(URL).unwrap();
    (registry, database, service)
}

fn nodes(database: &Arc<Database>) -> Vec<DatabaseReference> {
    (0..NODES)
        .map(|i| database.reference(&format!("nodes/n{}", i)).unwrap())
        .collect()
}

fn spawn_writer(database: &Arc<Database>, stop: &Arc<AtomicBool>) -> thread::JoinHandle<usize> {
    let database = Arc::clone(database);
    let stop = Arc::clone(stop);
    thread::spawn(move || {
        let mut writes = 0;
        while !stop.load(Ordering::SeqCst) {
            let node = writes % NODES;
            let child = database
                .reference(&format!("nodes/n{}/c{}", node, writes % 7))
                .unwrap();
            if writes % 5 == 4 {
                child.remove_value().wait().unwrap();
            } else {
                child.set_value(json!(writes)).wait().unwrap();
            }
            writes += 1;
        }
        writes
    })
}

#[test]
fn test_churn_with_concurrent_writer_stays_bounded() {
    let (registry, database, service) = setup();
    let refs = nodes(&database);
    let stale = Arc::new(AtomicUsize::new(0));
    // Handlers from cycles below this mark were removed and drained
    let retired = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let writer = spawn_writer(&database, &stop);

    for cycle in 0..CYCLES {
        let mut tokens = Vec::with_capacity(NODES * 3);
        for node in &refs {
            for kind in [
                EventKind::ChildAdded,
                EventKind::ChildChanged,
                EventKind::ChildRemoved,
            ] {
                let stale = Arc::clone(&stale);
                let retired = Arc::clone(&retired);
                let token = node
                    .on_child(kind, move |_| {
                        if cycle < retired.load(Ordering::SeqCst) {
                            stale.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                    .unwrap();
                tokens.push((node, token));
            }
            // Three kinds share one child aggregate per node
            assert_eq!(node.listener_count(), 3);
            assert_eq!(service.live_listeners_for(node.spec(), ListenerKind::Child), 1);
            assert!(registry.callbacks().len() <= NODES);
        }
        for (node, token) in tokens {
            assert!(node.remove_listener(token));
        }
        assert!(registry.callbacks().is_empty());
        // Anything still in flight for this cycle finishes before the mark moves
        service.flush();
        retired.store(cycle + 1, Ordering::SeqCst);
        for node in &refs {
            node.get_value().wait().unwrap();
        }
    }

    stop.store(true, Ordering::SeqCst);
    let writes = writer.join().unwrap();
    service.flush();

    let stats = service.stats();
    assert!(writes > 0);
    assert_eq!(stale.load(Ordering::SeqCst), 0);
    assert_eq!(stats.live_listeners, 0);
    assert_eq!(stats.listeners_created, (NODES * CYCLES) as u64);
    assert_eq!(stats.listeners_created, stats.listeners_destroyed);
    assert!(stats.peak_listeners_per_query <= 1);
    assert_eq!(stats.payloads_created, stats.payloads_released);
    assert!(registry.callbacks().is_empty());
    assert_eq!(registry.router().stats().handler_failures, 0);
}

#[test]
fn test_parallel_churn_on_shared_handles() {
    let (registry, database, service) = setup();
    let refs = Arc::new(nodes(&database));
    let stop = Arc::new(AtomicBool::new(false));
    let writer = spawn_writer(&database, &stop);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let refs = Arc::clone(&refs);
            thread::spawn(move || {
                for cycle in 0..CYCLES {
                    let node = &refs[(worker * 5 + cycle) % NODES];
                    let added = node.on_child_added(|_| {}).unwrap();
                    let changed = node.on_child_changed(|_| {}).unwrap();
                    let value = node.on_value(|_| {}).unwrap();
                    assert!(node.remove_listener(changed));
                    assert!(node.remove_listener(added));
                    assert!(node.remove_listener(value));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();
    service.flush();

    for node in refs.iter() {
        assert_eq!(node.listener_count(), 0);
        assert_eq!(service.live_listeners_for(node.spec(), ListenerKind::Child), 0);
        assert_eq!(service.live_listeners_for(node.spec(), ListenerKind::Value), 0);
    }
    let stats = service.stats();
    assert!(stats.peak_listeners_per_query <= 1);
    assert_eq!(stats.listeners_created, stats.listeners_destroyed);
    assert_eq!(stats.payloads_created, stats.payloads_released);
    assert!(registry.callbacks().is_empty());
}
