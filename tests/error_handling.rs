//! Error handling and edge case tests.

use parking_lot::Mutex;
use rtdb_bridge::{
    App, AppOptions, BridgeError, ChildEvent, Database, DatabaseRegistry, ErrorCode, EventKind,
    MemoryConnector, MemoryServiceConfig, MemorySyncService, TransactionResult, ValueEvent,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const URL: &str = "https://errors.example.com";

fn setup_with(
    config: MemoryServiceConfig,
) -> (DatabaseRegistry, Arc<Database>, Arc<MemorySyncService>) {
    let connector = Arc::new(MemoryConnector::new(config));
    let registry = DatabaseRegistry::new(connector.clone());
    let app = App::new(
        "errors",
        AppOptions {
            database_url: Some(URL.to_string()),
        },
    );
    let database = registry.get_default_instance(&app).unwrap();
    let service = connector.service_for(URL).unwrap();
    (registry, database, service)
}

fn setup() -> (DatabaseRegistry, Arc<Database>, Arc<MemorySyncService>) {
    setup_with(MemoryServiceConfig::default())
}

fn code_of(err: &BridgeError) -> Option<ErrorCode> {
    err.service_error().map(|e| e.code)
}

// --- Cancellation ---

#[test]
fn test_permission_denied_cancels_value_listener() {
    let (_registry, database, service) = setup();
    let secrets = database.reference("secrets").unwrap();
    let events: Arc<Mutex<Vec<ValueEvent>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&events);
    secrets.on_value(move |e| sink.lock().push(e.clone())).unwrap();
    service.flush();
    service.deny_access(secrets.path());
    service.flush();

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(events[0].snapshot().is_some());
    let error = events[1].error().unwrap();
    assert_eq!(error.code, ErrorCode::PermissionDenied);
}

#[test]
fn test_cancellation_reaches_every_child_subscriber() {
    let (_registry, database, service) = setup();
    let secrets = database.reference("secrets").unwrap();

    let cancelled = Arc::new(AtomicUsize::new(0));
    for kind in [
        EventKind::ChildAdded,
        EventKind::ChildChanged,
        EventKind::ChildMoved,
        EventKind::ChildRemoved,
    ] {
        let cancelled = Arc::clone(&cancelled);
        secrets
            .on_child(kind, move |e: &ChildEvent| {
                if e.error().is_some() {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }
    service.flush();
    service.deny_access(secrets.path());
    service.flush();

    // One native cancellation, fanned out to all four kinds
    assert_eq!(cancelled.load(Ordering::SeqCst), 4);
    assert_eq!(service.stats().listeners_created, 1);
}

#[test]
fn test_raw_native_codes_are_translated() {
    let (_registry, database, service) = setup();
    let games = database.reference("games").unwrap();
    let seen: Arc<Mutex<Option<ErrorCode>>> = Arc::new(Mutex::new(None));

    let sink = Arc::clone(&seen);
    games
        .on_value(move |e| {
            if let Some(error) = e.error() {
                *sink.lock() = Some(error.code);
            }
        })
        .unwrap();
    let id = games.value_aggregate().unwrap().callback_id().unwrap();

    service.inject_cancel(id, -24, "network error");
    service.flush();
    assert_eq!(*seen.lock(), Some(ErrorCode::NetworkError));

    service.inject_cancel(id, -12345, "something new");
    service.flush();
    assert_eq!(*seen.lock(), Some(ErrorCode::Unknown));
}

// --- Handler failures ---

#[test]
fn test_panicking_handler_is_contained() {
    let (registry, database, service) = setup();
    let games = database.reference("games").unwrap();
    let failures = registry.router().failures();
    let healthy = Arc::new(AtomicUsize::new(0));

    games.on_value(|_| panic!("handler exploded")).unwrap();
    let counter = Arc::clone(&healthy);
    games
        .on_value(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    service.flush();
    // The initial snapshot may have reached only the first subscriber
    while failures.try_recv().is_ok() {}
    let before = healthy.load(Ordering::SeqCst);
    let failed_before = registry.router().stats().handler_failures;

    games.set_value(json!({"g1": 1})).wait().unwrap();
    service.flush();

    assert_eq!(healthy.load(Ordering::SeqCst), before + 1);
    let failure = failures.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(failure.message.contains("handler exploded"));
    assert_eq!(
        Some(failure.callback_id),
        games.value_aggregate().unwrap().callback_id()
    );
    assert_eq!(registry.router().stats().handler_failures, failed_before + 1);

    // Delivery keeps working afterwards
    games.set_value(json!({"g1": 2})).wait().unwrap();
    service.flush();
    assert_eq!(healthy.load(Ordering::SeqCst), before + 2);
    assert_eq!(service.stats().payloads_created, service.stats().payloads_released);
}

#[test]
fn test_value_kind_rejected_for_child_subscription() {
    let (_registry, database, service) = setup();
    let games = database.reference("games").unwrap();

    let result = games.on_child(EventKind::Value, |_| {});
    assert!(matches!(result, Err(BridgeError::InvalidQuery(_))));
    assert_eq!(service.stats().listeners_created, 0);
}

// --- Transactions ---

#[test]
fn test_transaction_commits() {
    let (_registry, database, _service) = setup();
    let counter = database.reference("counter").unwrap();
    counter.set_value(json!(41)).wait().unwrap();

    let snapshot = counter
        .run_transaction(|data| {
            let next = data.value().as_i64().unwrap_or(0) + 1;
            data.set_value(json!(next));
            TransactionResult::Success
        })
        .wait()
        .unwrap();
    assert_eq!(snapshot.value(), &json!(42));
}

#[test]
fn test_transaction_panic_is_user_code_exception() {
    let (_registry, database, service) = setup();
    let counter = database.reference("counter").unwrap();

    let err = counter
        .run_transaction(|_| panic!("bad transaction"))
        .wait()
        .unwrap_err();
    assert_eq!(code_of(&err), Some(ErrorCode::UserCodeException));
    assert!(err.to_string().contains("bad transaction"));
    assert_eq!(service.value_at(counter.path()), json!(null));
}

#[test]
fn test_transaction_abort_reports_write_canceled() {
    let (_registry, database, service) = setup();
    let counter = database.reference("counter").unwrap();
    counter.set_value(json!(1)).wait().unwrap();

    let err = counter
        .run_transaction(|data| {
            data.set_value(json!(100));
            TransactionResult::Abort
        })
        .wait()
        .unwrap_err();
    assert_eq!(code_of(&err), Some(ErrorCode::WriteCanceled));
    assert_eq!(service.value_at(counter.path()), json!(1));
}

#[test]
fn test_transaction_retries_after_concurrent_write() {
    let (_registry, database, _service) = setup();
    let counter = database.reference("counter").unwrap();
    counter.set_value(json!(0)).wait().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let interloper = counter.clone();
    let attempts = Arc::clone(&calls);
    let snapshot = counter
        .run_transaction(move |data| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                // Lands between this attempt's read and its commit
                let _ = interloper.set_value(json!(10));
            }
            let next = data.value().as_i64().unwrap_or(0) + 1;
            data.set_value(json!(next));
            TransactionResult::Success
        })
        .wait()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.value(), &json!(11));
}

#[test]
fn test_transaction_gives_up_after_retry_limit() {
    let (_registry, database, _service) = setup_with(MemoryServiceConfig {
        max_transaction_retries: 2,
        ..Default::default()
    });
    let counter = database.reference("counter").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let interloper = counter.clone();
    let attempts = Arc::clone(&calls);
    let err = counter
        .run_transaction(move |data| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            let _ = interloper.set_value(json!(n));
            data.set_value(json!("mine"));
            TransactionResult::Success
        })
        .wait()
        .unwrap_err();

    assert_eq!(code_of(&err), Some(ErrorCode::MaxRetries));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

// --- Operations ---

#[test]
fn test_denied_write_fails_with_permission_denied() {
    let (_registry, database, service) = setup();
    let secrets = database.reference("secrets").unwrap();
    service.deny_access(secrets.path());

    let err = secrets.child("k").unwrap().set_value(json!(1)).wait().unwrap_err();
    assert_eq!(code_of(&err), Some(ErrorCode::PermissionDenied));
    let err = secrets.get_value().wait().unwrap_err();
    assert_eq!(code_of(&err), Some(ErrorCode::PermissionDenied));

    service.allow_access(secrets.path());
    secrets.child("k").unwrap().set_value(json!(1)).wait().unwrap();
    assert_eq!(secrets.get_value().wait().unwrap().value(), &json!({"k": 1}));
}

#[test]
fn test_update_children_rejects_invalid_keys() {
    let (_registry, database, service) = setup();
    let games = database.reference("games").unwrap();
    let mut values = serde_json::Map::new();
    values.insert("good".to_string(), json!(1));
    values.insert("bad.key".to_string(), json!(2));

    let err = games.update_children(values).wait().unwrap_err();
    assert_eq!(code_of(&err), Some(ErrorCode::OperationFailed));
    assert_eq!(service.value_at(games.path()), json!(null));
}

#[test]
fn test_operations_after_dispose_fail() {
    let (_registry, database, _service) = setup();
    let games = database.reference("games").unwrap();
    database.dispose();

    assert!(matches!(games.get_value().wait(), Err(BridgeError::Disposed)));
    assert!(matches!(
        games.run_transaction(|_| TransactionResult::Success).wait(),
        Err(BridgeError::Disposed)
    ));
    assert!(matches!(database.go_online(), Err(BridgeError::Disposed)));
    assert!(matches!(
        database.root_reference(),
        Err(BridgeError::Disposed)
    ));
}

#[test]
fn test_wait_timeout_on_blocked_completions() {
    let (_registry, database, service) = setup();
    let games = database.reference("games").unwrap();
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    let parked = database.reference("blocker").unwrap().run_transaction(move |_| {
        let _ = release_rx.recv();
        TransactionResult::Abort
    });
    let pending = games.get_value();
    assert!(matches!(
        pending.wait_timeout(Duration::from_millis(20)),
        Err(BridgeError::Timeout)
    ));

    drop(release_tx);
    assert!(parked.wait().is_err());
    assert!(pending.wait_timeout(Duration::from_secs(5)).is_ok());
    service.flush();
}
