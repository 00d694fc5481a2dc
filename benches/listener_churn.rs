//! Benchmarks for listener attach/detach and event routing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rtdb_bridge::{
    App, AppOptions, CallbackId, Database, DatabaseReference, DatabaseRegistry, DataSnapshot,
    DatabasePath, EventPayload, MemoryConnector, MemorySyncService,
};
use serde_json::json;
use std::sync::Arc;

const URL: &str = "https://bench.example.com";

fn setup() -> (DatabaseRegistry, Arc<Database>, Arc<MemorySyncService>) {
    let connector = Arc::new(MemoryConnector::default());
    let registry = DatabaseRegistry::new(connector.clone());
    let app = App::new(
        "bench",
        AppOptions {
            database_url: Some(URL.to_string()),
        },
    );
    let database = registry.get_default_instance(&app).unwrap();
    let service = connector.service_for(URL).unwrap();
    (registry, database, service)
}

/// First subscribe creates the native listener, last unsubscribe destroys it
fn bench_attach_detach(c: &mut Criterion) {
    let mut group = c.benchmark_group("attach_detach");

    for subscribers in [1usize, 3, 10] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let (_registry, database, service) = setup();
                let games = database.reference("games").unwrap();
                b.iter(|| {
                    let tokens: Vec<_> = (0..n)
                        .map(|_| games.on_child_added(|_| {}).unwrap())
                        .collect();
                    for token in tokens {
                        games.remove_listener(black_box(token));
                    }
                });
                service.flush();
            },
        );
    }

    group.finish();
}

/// Attach three child listeners per node, detach them, fetch each value
fn bench_node_churn(c: &mut Criterion) {
    let (_registry, database, service) = setup();
    let nodes: Vec<DatabaseReference> = (0..20)
        .map(|i| database.reference(&format!("nodes/n{}", i)).unwrap())
        .collect();

    c.bench_function("node_churn_20x3_fetch", |b| {
        b.iter(|| {
            let mut tokens = Vec::with_capacity(60);
            for node in &nodes {
                tokens.push((node, node.on_child_added(|_| {}).unwrap()));
                tokens.push((node, node.on_child_changed(|_| {}).unwrap()));
                tokens.push((node, node.on_child_removed(|_| {}).unwrap()));
            }
            for (node, token) in tokens {
                node.remove_listener(token);
            }
            for node in &nodes {
                black_box(node.get_value().wait().unwrap());
            }
        })
    });
    service.flush();
}

/// Router cost for routed and unroutable events
fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let (registry, database, service) = setup();
    let games = database.reference("games").unwrap();
    games.on_value(|event| {
        black_box(event.snapshot());
    })
    .unwrap();
    service.flush();

    let live = games.value_aggregate().unwrap().callback_id().unwrap();
    let router = Arc::clone(registry.router());
    let snapshot = DataSnapshot::new(DatabasePath::root(), json!({"score": 1}));

    group.bench_function("live_id", |b| {
        b.iter(|| router.on_value_changed(live, EventPayload::new(snapshot.clone())))
    });
    group.bench_function("unknown_id", |b| {
        b.iter(|| {
            router.on_value_changed(
                black_box(CallbackId(u64::MAX)),
                EventPayload::new(snapshot.clone()),
            )
        })
    });

    group.finish();
}

criterion_group!(benches, bench_attach_detach, bench_node_churn, bench_routing);
criterion_main!(benches);
