//! User-facing query and reference handles.

use super::params::{Limit, OrderBy, QueryParams, QuerySpec, QueryValue};
use crate::database::Database;
use crate::deferred::Deferred;
use crate::error::Result;
use crate::listeners::{
    panic_message, ChildAggregate, ChildEvent, EventKind, ListenerAggregate, ListenerToken,
    ValueAggregate, ValueEvent,
};
use crate::service::DisconnectOp;
use crate::types::{
    DataSnapshot, DatabasePath, ErrorCode, MutableData, ServiceError, TransactionResult,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

struct QueryInner {
    database: Arc<Database>,
    spec: QuerySpec,
    value: Mutex<Option<Arc<ValueAggregate>>>,
    child: Mutex<Option<Arc<ChildAggregate>>>,
}

/// A location plus ordering and filtering constraints.
///
/// Cloning shares the handle, including its listener aggregates. Refinement
/// methods return a new, independent handle. Two handles compare equal when
/// their canonical strings match.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl Query {
    pub(crate) fn new(database: Arc<Database>, path: DatabasePath, params: QueryParams) -> Self {
        let spec = QuerySpec::new(database.url(), path, params);
        Self {
            inner: Arc::new(QueryInner {
                database,
                spec,
                value: Mutex::new(None),
                child: Mutex::new(None),
            }),
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.inner.spec
    }

    pub fn path(&self) -> &DatabasePath {
        self.inner.spec.path()
    }

    pub fn params(&self) -> &QueryParams {
        self.inner.spec.params()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.inner.database
    }

    /// Reference to the unconstrained location of this query.
    pub fn reference(&self) -> DatabaseReference {
        DatabaseReference::new(Arc::clone(&self.inner.database), self.path().clone())
    }

    // --- Refinement ---

    fn refine(&self, params: Result<QueryParams>) -> Result<Query> {
        Ok(Query::new(
            Arc::clone(&self.inner.database),
            self.path().clone(),
            params?,
        ))
    }

    pub fn order_by_child(&self, path: &str) -> Result<Query> {
        self.refine(self.params().order_by(OrderBy::Child(path.to_string())))
    }

    pub fn order_by_key(&self) -> Result<Query> {
        self.refine(self.params().order_by(OrderBy::Key))
    }

    pub fn order_by_value(&self) -> Result<Query> {
        self.refine(self.params().order_by(OrderBy::Value))
    }

    pub fn order_by_priority(&self) -> Result<Query> {
        self.refine(self.params().order_by(OrderBy::Priority))
    }

    pub fn start_at(&self, value: impl Into<QueryValue>) -> Result<Query> {
        self.refine(self.params().start_at(value.into(), None))
    }

    pub fn start_at_with_key(&self, value: impl Into<QueryValue>, key: &str) -> Result<Query> {
        self.refine(self.params().start_at(value.into(), Some(key.to_string())))
    }

    pub fn end_at(&self, value: impl Into<QueryValue>) -> Result<Query> {
        self.refine(self.params().end_at(value.into(), None))
    }

    pub fn end_at_with_key(&self, value: impl Into<QueryValue>, key: &str) -> Result<Query> {
        self.refine(self.params().end_at(value.into(), Some(key.to_string())))
    }

    pub fn equal_to(&self, value: impl Into<QueryValue>) -> Result<Query> {
        self.refine(self.params().equal_to(value.into(), None))
    }

    pub fn equal_to_with_key(&self, value: impl Into<QueryValue>, key: &str) -> Result<Query> {
        self.refine(self.params().equal_to(value.into(), Some(key.to_string())))
    }

    pub fn limit_to_first(&self, limit: u32) -> Result<Query> {
        self.refine(self.params().limit(Limit::First(limit)))
    }

    pub fn limit_to_last(&self, limit: u32) -> Result<Query> {
        self.refine(self.params().limit(Limit::Last(limit)))
    }

    // --- Subscriptions ---

    fn value_aggregate_or_create(&self) -> Arc<ValueAggregate> {
        let mut slot = self.inner.value.lock();
        Arc::clone(slot.get_or_insert_with(|| {
            ValueAggregate::new(Arc::clone(&self.inner.database), self.inner.spec.clone())
        }))
    }

    fn child_aggregate_or_create(&self) -> Arc<ChildAggregate> {
        let mut slot = self.inner.child.lock();
        Arc::clone(slot.get_or_insert_with(|| {
            ChildAggregate::new(Arc::clone(&self.inner.database), self.inner.spec.clone())
        }))
    }

    /// Subscribe to value changes.
    pub fn on_value<F>(&self, handler: F) -> Result<ListenerToken>
    where
        F: Fn(&ValueEvent) + Send + Sync + 'static,
    {
        self.value_aggregate_or_create()
            .add_subscriber(Arc::new(handler))
    }

    /// Subscribe to one kind of child event. `kind` must not be `Value`.
    pub fn on_child<F>(&self, kind: EventKind, handler: F) -> Result<ListenerToken>
    where
        F: Fn(&ChildEvent) + Send + Sync + 'static,
    {
        self.child_aggregate_or_create()
            .add_subscriber(kind, Arc::new(handler))
    }

    pub fn on_child_added<F>(&self, handler: F) -> Result<ListenerToken>
    where
        F: Fn(&ChildEvent) + Send + Sync + 'static,
    {
        self.on_child(EventKind::ChildAdded, handler)
    }

    pub fn on_child_changed<F>(&self, handler: F) -> Result<ListenerToken>
    where
        F: Fn(&ChildEvent) + Send + Sync + 'static,
    {
        self.on_child(EventKind::ChildChanged, handler)
    }

    pub fn on_child_moved<F>(&self, handler: F) -> Result<ListenerToken>
    where
        F: Fn(&ChildEvent) + Send + Sync + 'static,
    {
        self.on_child(EventKind::ChildMoved, handler)
    }

    pub fn on_child_removed<F>(&self, handler: F) -> Result<ListenerToken>
    where
        F: Fn(&ChildEvent) + Send + Sync + 'static,
    {
        self.on_child(EventKind::ChildRemoved, handler)
    }

    /// Remove one subscription. Returns false if it was not attached here.
    ///
    /// Once this returns the handler will not be invoked again.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        match token.kind() {
            EventKind::Value => match self.value_aggregate() {
                Some(aggregate) => aggregate.remove_subscriber(token),
                None => false,
            },
            _ => match self.child_aggregate() {
                Some(aggregate) => aggregate.remove_subscriber(token),
                None => false,
            },
        }
    }

    /// Remove every subscription on this handle. Returns how many were removed.
    pub fn clear_listeners(&self) -> usize {
        let value = self.value_aggregate().map_or(0, |a| a.detach_all());
        let child = self.child_aggregate().map_or(0, |a| a.detach_all());
        value + child
    }

    pub fn listener_count(&self) -> usize {
        self.value_aggregate().map_or(0, |a| a.subscriber_count())
            + self.child_aggregate().map_or(0, |a| a.subscriber_count())
    }

    /// The value aggregate, if anything ever subscribed to values.
    pub fn value_aggregate(&self) -> Option<Arc<ValueAggregate>> {
        self.inner.value.lock().clone()
    }

    /// The child aggregate, if anything ever subscribed to child events.
    pub fn child_aggregate(&self) -> Option<Arc<ChildAggregate>> {
        self.inner.child.lock().clone()
    }

    // --- Data ---

    /// Fetch the current value once.
    pub fn get_value(&self) -> Deferred<DataSnapshot> {
        let spec = self.inner.spec.clone();
        self.inner
            .database
            .run_operation(move |service, done| service.get_value(&spec, done))
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.inner.spec == other.inner.spec
    }
}

impl Eq for Query {}

impl Hash for Query {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.spec.hash(state);
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({})", self.inner.spec)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.spec, f)
    }
}

/// A query with no constraints: a plain location that can be written to.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DatabaseReference {
    query: Query,
}

impl DatabaseReference {
    pub(crate) fn new(database: Arc<Database>, path: DatabasePath) -> Self {
        Self {
            query: Query::new(database, path, QueryParams::default()),
        }
    }

    pub fn as_query(&self) -> &Query {
        &self.query
    }

    /// Last path segment, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.query.path().key()
    }

    pub fn child(&self, path: &str) -> Result<DatabaseReference> {
        let path = self.query.path().child(path)?;
        Ok(Self::new(Arc::clone(self.query.database()), path))
    }

    pub fn parent(&self) -> Option<DatabaseReference> {
        let path = self.query.path().parent()?;
        Some(Self::new(Arc::clone(self.query.database()), path))
    }

    pub fn root(&self) -> DatabaseReference {
        Self::new(Arc::clone(self.query.database()), DatabasePath::root())
    }

    pub fn set_value(&self, value: Value) -> Deferred<()> {
        self.write(value, None)
    }

    pub fn set_value_and_priority(&self, value: Value, priority: Value) -> Deferred<()> {
        self.write(value, Some(priority))
    }

    fn write(&self, value: Value, priority: Option<Value>) -> Deferred<()> {
        let path = self.query.path().clone();
        self.query
            .database()
            .run_operation(move |service, done| service.set_value(&path, value, priority, done))
    }

    pub fn set_priority(&self, priority: Value) -> Deferred<()> {
        let path = self.query.path().clone();
        self.query
            .database()
            .run_operation(move |service, done| service.set_priority(&path, priority, done))
    }

    /// Write several children at once; keys may be slash separated paths.
    pub fn update_children(&self, values: Map<String, Value>) -> Deferred<()> {
        let path = self.query.path().clone();
        self.query
            .database()
            .run_operation(move |service, done| service.update_children(&path, values, done))
    }

    pub fn remove_value(&self) -> Deferred<()> {
        self.set_value(Value::Null)
    }

    /// Atomically modify the data at this location.
    ///
    /// `handler` may run several times if the data changes underneath it.
    /// A panic inside it fails the transaction with
    /// [`ErrorCode::UserCodeException`].
    pub fn run_transaction<F>(&self, handler: F) -> Deferred<DataSnapshot>
    where
        F: Fn(&mut MutableData) -> TransactionResult + Send + Sync + 'static,
    {
        let path = self.query.path().clone();
        let guarded = move |data: &mut MutableData| {
            catch_unwind(AssertUnwindSafe(|| handler(data))).map_err(|panic| {
                ServiceError::new(
                    ErrorCode::UserCodeException,
                    panic_message(panic.as_ref()),
                )
            })
        };
        self.query.database().run_operation(move |service, done| {
            service.run_transaction(&path, Box::new(guarded), done)
        })
    }

    /// Actions the server applies when this client disconnects.
    pub fn on_disconnect(&self) -> OnDisconnect {
        OnDisconnect {
            database: Arc::clone(self.query.database()),
            path: self.query.path().clone(),
        }
    }
}

impl Deref for DatabaseReference {
    type Target = Query;

    fn deref(&self) -> &Query {
        &self.query
    }
}

impl fmt::Debug for DatabaseReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseReference({})", self.query.spec())
    }
}

impl fmt::Display for DatabaseReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.query, f)
    }
}

/// Disconnect actions registered for one location.
pub struct OnDisconnect {
    database: Arc<Database>,
    path: DatabasePath,
}

impl OnDisconnect {
    pub fn set_value(&self, value: Value) -> Deferred<()> {
        self.queue(DisconnectOp::Set {
            value,
            priority: None,
        })
    }

    pub fn set_value_and_priority(&self, value: Value, priority: Value) -> Deferred<()> {
        self.queue(DisconnectOp::Set {
            value,
            priority: Some(priority),
        })
    }

    pub fn update_children(&self, values: Map<String, Value>) -> Deferred<()> {
        self.queue(DisconnectOp::Update(values))
    }

    pub fn remove_value(&self) -> Deferred<()> {
        self.queue(DisconnectOp::Remove)
    }

    /// Cancel every action queued at or below this location.
    pub fn cancel(&self) -> Deferred<()> {
        self.queue(DisconnectOp::Cancel)
    }

    fn queue(&self, op: DisconnectOp) -> Deferred<()> {
        let path = self.path.clone();
        self.database
            .run_operation(move |service, done| service.on_disconnect(&path, op, done))
    }
}
