//! In-process [`SyncService`] backed by a JSON tree.
//!
//! Stands in for the native engine in tests, benchmarks and demos. Listener
//! events are queued and delivered on a dedicated thread, the way the native
//! engine calls back on its own threads. Operation completions and
//! transaction handlers run on a second thread, so a listener handler may
//! wait on an operation it starts. Query
//! parameters are ignored: a listener sees the whole location it names.
//!
//! The service counts the native resources it hands out (listeners and
//! event payloads) so callers can check nothing leaks.

use super::{
    Completion, Connector, DisconnectOp, ListenerKind, NativeListener, SyncService,
    TransactionHandler,
};
use crate::app::App;
use crate::error::Result;
use crate::query::QuerySpec;
use crate::router::{EventPayload, EventRouter};
use crate::types::{
    CallbackId, ChildChangeKind, DataSnapshot, DatabasePath, ErrorCode, MutableData, ServiceError,
    TransactionResult,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, trace, warn};

/// Retries before a contended transaction gives up.
const DEFAULT_MAX_TRANSACTION_RETRIES: u32 = 25;

/// In-memory service configuration.
#[derive(Clone, Debug)]
pub struct MemoryServiceConfig {
    /// Default: 25
    pub max_transaction_retries: u32,
    /// Default: true
    pub start_online: bool,
}

impl Default for MemoryServiceConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
            start_online: true,
        }
    }
}

/// Resource accounting for one service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryServiceStats {
    pub listeners_created: u64,
    pub listeners_destroyed: u64,
    pub live_listeners: usize,
    /// Most native listeners ever alive at once for one query and kind.
    pub peak_listeners_per_query: usize,
    pub payloads_created: u64,
    pub payloads_released: u64,
}

#[derive(Default)]
struct Counters {
    listeners_created: AtomicU64,
    listeners_destroyed: AtomicU64,
    payloads_created: AtomicU64,
    payloads_released: AtomicU64,
}

struct ListenerRecord {
    callback_id: CallbackId,
    path: DatabasePath,
    canonical: String,
    kind: ListenerKind,
}

enum PriorityUpdate {
    Keep,
    Set(Value),
    Clear,
}

struct TreeState {
    root: Value,
    priorities: HashMap<DatabasePath, Value>,
    listeners: BTreeMap<u64, ListenerRecord>,
    disconnect_ops: Vec<(DatabasePath, DisconnectOp)>,
    denied: Vec<DatabasePath>,
    online: bool,
    shut_down: bool,
    next_listener: u64,
    /// Bumped on every write; transactions compare it before committing.
    version: u64,
    peak_per_query: usize,
}

impl TreeState {
    fn is_denied(&self, path: &DatabasePath) -> bool {
        self.denied.iter().any(|rule| rule.contains(path))
    }

    fn snapshot(&self, path: &DatabasePath) -> DataSnapshot {
        DataSnapshot::new(path.clone(), get_at(&self.root, path.segments()))
            .with_priority(self.priorities.get(path).cloned())
    }
}

enum Delivery {
    Value {
        callback_id: CallbackId,
        payload: EventPayload,
    },
    Child {
        callback_id: CallbackId,
        kind: ChildChangeKind,
        payload: EventPayload,
        previous_key: Option<String>,
    },
    Cancelled {
        callback_id: CallbackId,
        error: ServiceError,
    },
    Flush(Sender<()>),
    Shutdown,
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Flush(Sender<()>),
    Shutdown,
}

/// JSON-tree implementation of the native sync service.
pub struct MemorySyncService {
    url: String,
    config: MemoryServiceConfig,
    state: Mutex<TreeState>,
    queue: Sender<Delivery>,
    jobs: Sender<Job>,
    counters: Arc<Counters>,
    me: Weak<MemorySyncService>,
}

impl MemorySyncService {
    /// Create the service and start its delivery and completion threads.
    pub fn new(url: &str, router: Arc<EventRouter>, config: MemoryServiceConfig) -> Arc<Self> {
        let (queue, receiver) = unbounded();
        let (jobs, job_receiver) = unbounded();
        let online = config.start_online;

        let service = Arc::new_cyclic(|me| Self {
            url: url.to_string(),
            config,
            state: Mutex::new(TreeState {
                root: Value::Null,
                priorities: HashMap::new(),
                listeners: BTreeMap::new(),
                disconnect_ops: Vec::new(),
                denied: Vec::new(),
                online,
                shut_down: false,
                next_listener: 1,
                version: 0,
                peak_per_query: 0,
            }),
            queue,
            jobs,
            counters: Arc::new(Counters::default()),
            me: me.clone(),
        });

        let spawned = thread::Builder::new()
            .name("rtdb-delivery".to_string())
            .spawn(move || deliver(receiver, router));
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start delivery thread");
        }
        let spawned = thread::Builder::new()
            .name("rtdb-completion".to_string())
            .spawn(move || run_jobs(job_receiver));
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start completion thread");
        }
        service
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Block until every completion and event queued so far has run.
    ///
    /// Completions go first since they may queue events of their own. Must
    /// not be called from a listener handler or a transaction handler.
    pub fn flush(&self) {
        let (ack, done) = bounded(1);
        if self.jobs.send(Job::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
        let (ack, done) = bounded(1);
        if self.queue.send(Delivery::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    pub fn stats(&self) -> MemoryServiceStats {
        let state = self.state.lock();
        MemoryServiceStats {
            listeners_created: self.counters.listeners_created.load(Ordering::SeqCst),
            listeners_destroyed: self.counters.listeners_destroyed.load(Ordering::SeqCst),
            live_listeners: state.listeners.len(),
            peak_listeners_per_query: state.peak_per_query,
            payloads_created: self.counters.payloads_created.load(Ordering::SeqCst),
            payloads_released: self.counters.payloads_released.load(Ordering::SeqCst),
        }
    }

    /// Live native listeners for `query` of the given kind.
    pub fn live_listeners_for(&self, query: &QuerySpec, kind: ListenerKind) -> usize {
        self.state
            .lock()
            .listeners
            .values()
            .filter(|r| r.canonical == query.canonical() && r.kind == kind)
            .count()
    }

    /// Current value stored at `path`.
    pub fn value_at(&self, path: &DatabasePath) -> Value {
        get_at(&self.state.lock().root, path.segments())
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub fn pending_disconnect_ops(&self) -> usize {
        self.state.lock().disconnect_ops.len()
    }

    /// Deny reads and writes at and below `path`. Listeners already there
    /// are cancelled with `PermissionDenied`.
    pub fn deny_access(&self, path: &DatabasePath) {
        let mut state = self.state.lock();
        state.denied.push(path.clone());
        let cancelled: Vec<CallbackId> = state
            .listeners
            .values()
            .filter(|r| path.contains(&r.path))
            .map(|r| r.callback_id)
            .collect();
        for callback_id in cancelled {
            self.enqueue(Delivery::Cancelled {
                callback_id,
                error: permission_denied(),
            });
        }
    }

    pub fn allow_access(&self, path: &DatabasePath) {
        self.state.lock().denied.retain(|rule| rule != path);
    }

    // --- Raw event injection ---

    /// Emit a value event for an arbitrary callback id.
    pub fn inject_value(&self, callback_id: CallbackId, path: &DatabasePath, value: Value) {
        let payload = self.payload(DataSnapshot::new(path.clone(), value));
        self.enqueue(Delivery::Value {
            callback_id,
            payload,
        });
    }

    /// Emit a child event for an arbitrary callback id.
    pub fn inject_child(
        &self,
        callback_id: CallbackId,
        kind: ChildChangeKind,
        path: &DatabasePath,
        value: Value,
        previous_key: Option<String>,
    ) {
        let payload = self.payload(DataSnapshot::new(path.clone(), value));
        self.enqueue(Delivery::Child {
            callback_id,
            kind,
            payload,
            previous_key,
        });
    }

    /// Emit a cancellation with a raw native error code.
    pub fn inject_cancel(&self, callback_id: CallbackId, code: i32, message: &str) {
        self.enqueue(Delivery::Cancelled {
            callback_id,
            error: ServiceError::from_native(code, message),
        });
    }

    // --- Internals ---

    fn enqueue(&self, delivery: Delivery) {
        if self.queue.send(delivery).is_err() {
            trace!(url = %self.url, "delivery thread gone, dropping delivery");
        }
    }

    fn payload(&self, snapshot: DataSnapshot) -> EventPayload {
        self.counters.payloads_created.fetch_add(1, Ordering::SeqCst);
        let counters = Arc::clone(&self.counters);
        EventPayload::with_release(snapshot, move || {
            counters.payloads_released.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn complete<T: Send + 'static>(
        &self,
        done: Completion<T>,
        result: std::result::Result<T, ServiceError>,
    ) {
        self.spawn_job(Box::new(move || done(result)));
    }

    fn spawn_job(&self, job: Box<dyn FnOnce() + Send>) {
        if self.jobs.send(Job::Run(job)).is_err() {
            trace!(url = %self.url, "completion thread gone, dropping job");
        }
    }

    fn check_usable(
        &self,
        state: &TreeState,
        path: &DatabasePath,
    ) -> std::result::Result<(), ServiceError> {
        if state.shut_down {
            return Err(ServiceError::new(ErrorCode::Disconnected, "connection shut down"));
        }
        if state.is_denied(path) {
            return Err(permission_denied());
        }
        Ok(())
    }

    /// Apply a write and queue the events it causes.
    fn apply(
        &self,
        state: &mut TreeState,
        path: &DatabasePath,
        value: Value,
        priority: PriorityUpdate,
    ) {
        let before = state.root.clone();
        let removing = value.is_null();
        set_at(&mut state.root, path.segments(), value);
        match priority {
            PriorityUpdate::Keep => {}
            PriorityUpdate::Set(p) => {
                state.priorities.insert(path.clone(), p);
            }
            PriorityUpdate::Clear => {
                state.priorities.remove(path);
            }
        }
        if removing {
            state.priorities.retain(|p, _| !path.contains(p));
        }
        state.version += 1;
        self.emit_changes(state, &before, path);
    }

    fn emit_changes(&self, state: &TreeState, before: &Value, changed: &DatabasePath) {
        for record in state.listeners.values() {
            if !(record.path.contains(changed) || changed.contains(&record.path)) {
                continue;
            }
            let old = get_at(before, record.path.segments());
            let new = get_at(&state.root, record.path.segments());
            if old == new {
                continue;
            }
            match record.kind {
                ListenerKind::Value => {
                    let payload = self.payload(state.snapshot(&record.path));
                    self.enqueue(Delivery::Value {
                        callback_id: record.callback_id,
                        payload,
                    });
                }
                ListenerKind::Child => self.emit_child_diff(record, &old, &new),
            }
        }
    }

    fn emit_child_diff(&self, record: &ListenerRecord, old: &Value, new: &Value) {
        let empty = Map::new();
        let old_children = old.as_object().unwrap_or(&empty);
        let new_children = new.as_object().unwrap_or(&empty);

        for (key, value) in old_children {
            if !new_children.contains_key(key) {
                self.emit_child(record, ChildChangeKind::Removed, key, value.clone(), None);
            }
        }

        let mut previous: Option<&String> = None;
        for (key, value) in new_children {
            let kind = match old_children.get(key) {
                None => Some(ChildChangeKind::Added),
                Some(old_value) if old_value != value => Some(ChildChangeKind::Changed),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                self.emit_child(record, kind, key, value.clone(), previous.cloned());
            }
            previous = Some(key);
        }
    }

    fn emit_child(
        &self,
        record: &ListenerRecord,
        kind: ChildChangeKind,
        key: &str,
        value: Value,
        previous_key: Option<String>,
    ) {
        let path = match record.path.child(key) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "skipping child with invalid key");
                return;
            }
        };
        let payload = self.payload(DataSnapshot::new(path, value));
        self.enqueue(Delivery::Child {
            callback_id: record.callback_id,
            kind,
            payload,
            previous_key,
        });
    }

    fn transaction(
        &self,
        path: &DatabasePath,
        handler: &TransactionHandler,
    ) -> std::result::Result<DataSnapshot, ServiceError> {
        for attempt in 0..=self.config.max_transaction_retries {
            let (version, current) = {
                let state = self.state.lock();
                self.check_usable(&state, path)?;
                let snapshot = state.snapshot(path);
                (state.version, snapshot)
            };

            let mut data = MutableData::new(
                path.clone(),
                current.value().clone(),
                current.priority().cloned(),
            );
            match handler(&mut data)? {
                TransactionResult::Abort => {
                    return Err(ServiceError::new(
                        ErrorCode::WriteCanceled,
                        "transaction aborted by handler",
                    ));
                }
                TransactionResult::Success => {}
            }

            let mut state = self.state.lock();
            self.check_usable(&state, path)?;
            if state.version != version {
                trace!(%path, attempt, "transaction data changed, retrying");
                continue;
            }
            let (value, priority) = data.into_parts();
            let priority = match priority {
                Some(p) => PriorityUpdate::Set(p),
                None => PriorityUpdate::Clear,
            };
            self.apply(&mut state, path, value, priority);
            return Ok(state.snapshot(path));
        }
        Err(ServiceError::new(
            ErrorCode::MaxRetries,
            "transaction exceeded its retry limit",
        ))
    }
}

impl SyncService for MemorySyncService {
    fn create_listener(
        &self,
        query: &QuerySpec,
        kind: ListenerKind,
        callback_id: CallbackId,
    ) -> std::result::Result<NativeListener, ServiceError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(ServiceError::new(ErrorCode::Disconnected, "connection shut down"));
        }

        let raw = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(
            raw,
            ListenerRecord {
                callback_id,
                path: query.path().clone(),
                canonical: query.canonical().to_string(),
                kind,
            },
        );
        let same_query = state
            .listeners
            .values()
            .filter(|r| r.canonical == query.canonical() && r.kind == kind)
            .count();
        state.peak_per_query = state.peak_per_query.max(same_query);
        self.counters.listeners_created.fetch_add(1, Ordering::SeqCst);

        // Initial events, delivered later on the delivery thread.
        if state.is_denied(query.path()) {
            self.enqueue(Delivery::Cancelled {
                callback_id,
                error: permission_denied(),
            });
        } else {
            match kind {
                ListenerKind::Value => {
                    let payload = self.payload(state.snapshot(query.path()));
                    self.enqueue(Delivery::Value {
                        callback_id,
                        payload,
                    });
                }
                ListenerKind::Child => {
                    let current = get_at(&state.root, query.path().segments());
                    if let Some(record) = state.listeners.get(&raw) {
                        self.emit_child_diff(record, &Value::Null, &current);
                    }
                }
            }
        }

        Ok(NativeListener::new(raw))
    }

    fn destroy_listener(&self, listener: NativeListener) {
        if self.state.lock().listeners.remove(&listener.raw()).is_some() {
            self.counters.listeners_destroyed.fetch_add(1, Ordering::SeqCst);
        } else {
            warn!(?listener, "destroying unknown native listener");
        }
    }

    fn get_value(&self, query: &QuerySpec, done: Completion<DataSnapshot>) {
        let result = {
            let state = self.state.lock();
            self.check_usable(&state, query.path())
                .map(|()| state.snapshot(query.path()))
        };
        self.complete(done, result);
    }

    fn set_value(
        &self,
        path: &DatabasePath,
        value: Value,
        priority: Option<Value>,
        done: Completion<()>,
    ) {
        let result = {
            let mut state = self.state.lock();
            self.check_usable(&state, path).map(|()| {
                let priority = match priority {
                    Some(p) => PriorityUpdate::Set(p),
                    None => PriorityUpdate::Clear,
                };
                self.apply(&mut state, path, value, priority);
            })
        };
        self.complete(done, result);
    }

    fn set_priority(&self, path: &DatabasePath, priority: Value, done: Completion<()>) {
        let result = {
            let mut state = self.state.lock();
            self.check_usable(&state, path).map(|()| {
                state.priorities.insert(path.clone(), priority);
                state.version += 1;
            })
        };
        self.complete(done, result);
    }

    fn update_children(
        &self,
        path: &DatabasePath,
        values: Map<String, Value>,
        done: Completion<()>,
    ) {
        let result = {
            let mut state = self.state.lock();
            self.check_usable(&state, path).and_then(|()| {
                let mut writes = Vec::with_capacity(values.len());
                for (key, value) in values {
                    let child = path
                        .child(&key)
                        .map_err(|e| ServiceError::new(ErrorCode::OperationFailed, e.to_string()))?;
                    writes.push((child, value));
                }
                let before = state.root.clone();
                for (child, value) in writes {
                    set_at(&mut state.root, child.segments(), value);
                }
                state.version += 1;
                self.emit_changes(&state, &before, path);
                Ok(())
            })
        };
        self.complete(done, result);
    }

    fn run_transaction(
        &self,
        path: &DatabasePath,
        handler: TransactionHandler,
        done: Completion<DataSnapshot>,
    ) {
        let me = self.me.clone();
        let path = path.clone();
        // Handlers are user code: run them on the completion thread, never
        // under the state lock.
        self.spawn_job(Box::new(move || {
            let result = match me.upgrade() {
                Some(service) => service.transaction(&path, &handler),
                None => Err(ServiceError::new(ErrorCode::Disconnected, "connection shut down")),
            };
            done(result);
        }));
    }

    fn on_disconnect(&self, path: &DatabasePath, op: DisconnectOp, done: Completion<()>) {
        let result = {
            let mut state = self.state.lock();
            self.check_usable(&state, path).map(|()| match op {
                DisconnectOp::Cancel => state.disconnect_ops.retain(|(p, _)| !path.contains(p)),
                op => state.disconnect_ops.push((path.clone(), op)),
            })
        };
        self.complete(done, result);
    }

    fn go_online(&self) {
        self.state.lock().online = true;
    }

    fn go_offline(&self) {
        let mut state = self.state.lock();
        if !state.online {
            return;
        }
        state.online = false;

        let ops = std::mem::take(&mut state.disconnect_ops);
        debug!(url = %self.url, ops = ops.len(), "offline, applying disconnect actions");
        for (path, op) in ops {
            match op {
                DisconnectOp::Set { value, priority } => {
                    let priority = match priority {
                        Some(p) => PriorityUpdate::Set(p),
                        None => PriorityUpdate::Clear,
                    };
                    self.apply(&mut state, &path, value, priority);
                }
                DisconnectOp::Update(values) => {
                    for (key, value) in values {
                        if let Ok(child) = path.child(&key) {
                            self.apply(&mut state, &child, value, PriorityUpdate::Keep);
                        }
                    }
                }
                DisconnectOp::Remove => {
                    self.apply(&mut state, &path, Value::Null, PriorityUpdate::Clear);
                }
                DisconnectOp::Cancel => {}
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
        }
        debug!(url = %self.url, "shutting down memory sync service");
        let _ = self.jobs.send(Job::Shutdown);
        self.enqueue(Delivery::Shutdown);
    }
}

impl Drop for MemorySyncService {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        let _ = self.queue.send(Delivery::Shutdown);
    }
}

/// Delivery thread body: hands queued events to the router in order.
fn deliver(receiver: Receiver<Delivery>, router: Arc<EventRouter>) {
    while let Ok(delivery) = receiver.recv() {
        match delivery {
            Delivery::Value {
                callback_id,
                payload,
            } => router.on_value_changed(callback_id, payload),
            Delivery::Child {
                callback_id,
                kind: ChildChangeKind::Removed,
                payload,
                ..
            } => router.on_child_removed(callback_id, payload),
            Delivery::Child {
                callback_id,
                kind,
                payload,
                previous_key,
            } => router.on_child_changed(callback_id, kind, payload, previous_key),
            Delivery::Cancelled { callback_id, error } => {
                router.on_cancelled(callback_id, error.code.code(), &error.message)
            }
            Delivery::Flush(ack) => {
                let _ = ack.send(());
            }
            Delivery::Shutdown => break,
        }
    }
}

/// Completion thread body: runs operation completions in issue order.
fn run_jobs(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(job) => job(),
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            Job::Shutdown => break,
        }
    }
}

fn permission_denied() -> ServiceError {
    ServiceError::new(
        ErrorCode::PermissionDenied,
        "Client doesn't have permission to access the desired data.",
    )
}

fn get_at(root: &Value, segments: &[String]) -> Value {
    let mut node = root;
    for segment in segments {
        match node.get(segment.as_str()) {
            Some(child) => node = child,
            None => return Value::Null,
        }
    }
    node.clone()
}

fn set_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = normalize(value);
        return;
    };
    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let now_empty = match node {
        Value::Object(map) => {
            let child = map.entry(head.clone()).or_insert(Value::Null);
            set_at(child, rest, value);
            if child.is_null() {
                map.remove(head);
            }
            map.is_empty()
        }
        _ => false,
    };
    if now_empty {
        *node = Value::Null;
    }
}

/// Nulls and empty objects are absent data.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// Connector producing [`MemorySyncService`]s.
pub struct MemoryConnector {
    config: MemoryServiceConfig,
    services: Mutex<Vec<Arc<MemorySyncService>>>,
}

impl MemoryConnector {
    pub fn new(config: MemoryServiceConfig) -> Self {
        Self {
            config,
            services: Mutex::new(Vec::new()),
        }
    }

    /// Most recent service connected to `url`.
    pub fn service_for(&self, url: &str) -> Option<Arc<MemorySyncService>> {
        let url = url.trim_end_matches('/');
        self.services
            .lock()
            .iter()
            .rev()
            .find(|s| s.url() == url)
            .cloned()
    }

    /// Every service connected so far.
    pub fn services(&self) -> Vec<Arc<MemorySyncService>> {
        self.services.lock().clone()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new(MemoryServiceConfig::default())
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        _app: &App,
        url: &str,
        router: Arc<EventRouter>,
    ) -> Result<Arc<dyn SyncService>> {
        let service = MemorySyncService::new(url, router, self.config.clone());
        self.services.lock().push(Arc::clone(&service));
        Ok(service)
    }
}
