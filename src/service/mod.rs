//! Interface of the native sync service this layer binds to.
//!
//! The service is opaque: it evaluates queries, keeps the local cache and
//! talks to the server. This layer only asks it to create and destroy
//! listeners, run data operations, and toggle connectivity. Listener events
//! come back through the [`EventRouter`](crate::router::EventRouter), tagged
//! with the [`CallbackId`] that was passed to [`SyncService::create_listener`].
//!
//! # Delivery contract
//!
//! Implementations must never invoke router callbacks or completions
//! synchronously from inside `create_listener` or `destroy_listener`; those
//! calls are made while a listener aggregate holds its lock.

pub mod memory;

use crate::app::App;
use crate::error::Result;
use crate::query::QuerySpec;
use crate::router::EventRouter;
use crate::types::{
    CallbackId, DataSnapshot, DatabasePath, MutableData, ServiceError, TransactionResult,
};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub use memory::{MemoryConnector, MemoryServiceConfig, MemoryServiceStats, MemorySyncService};

/// Which native listener flavour an aggregate owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Whole-value change notifications.
    Value,
    /// Per-child added/changed/moved/removed notifications.
    Child,
}

/// Handle to a listener living inside the native service.
///
/// Not `Clone`: exactly one owner may destroy it.
#[derive(PartialEq, Eq, Hash)]
pub struct NativeListener(u64);

impl NativeListener {
    pub fn new(raw: u64) -> Self {
        NativeListener(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NativeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeListener({})", self.0)
    }
}

/// Completion of an asynchronous native operation.
pub type Completion<T> = Box<dyn FnOnce(std::result::Result<T, ServiceError>) + Send + 'static>;

/// User code run by the service to compute a transaction's new value.
///
/// An `Err` aborts the transaction and is reported through its completion.
pub type TransactionHandler = Box<
    dyn Fn(&mut MutableData) -> std::result::Result<TransactionResult, ServiceError>
        + Send
        + Sync
        + 'static,
>;

/// Action the server performs when this client disconnects.
#[derive(Clone, Debug, PartialEq)]
pub enum DisconnectOp {
    Set { value: Value, priority: Option<Value> },
    Update(Map<String, Value>),
    Remove,
    /// Drop every queued action at or below the location.
    Cancel,
}

/// Operations consumed from the native sync service.
pub trait SyncService: Send + Sync {
    /// Start listening to `query`; events are tagged with `callback_id`.
    fn create_listener(
        &self,
        query: &QuerySpec,
        kind: ListenerKind,
        callback_id: CallbackId,
    ) -> std::result::Result<NativeListener, ServiceError>;

    /// Stop a listener. Events already queued for it may still be delivered.
    fn destroy_listener(&self, listener: NativeListener);

    fn get_value(&self, query: &QuerySpec, done: Completion<DataSnapshot>);

    fn set_value(
        &self,
        path: &DatabasePath,
        value: Value,
        priority: Option<Value>,
        done: Completion<()>,
    );

    fn set_priority(&self, path: &DatabasePath, priority: Value, done: Completion<()>);

    fn update_children(
        &self,
        path: &DatabasePath,
        values: Map<String, Value>,
        done: Completion<()>,
    );

    fn run_transaction(
        &self,
        path: &DatabasePath,
        handler: TransactionHandler,
        done: Completion<DataSnapshot>,
    );

    fn on_disconnect(&self, path: &DatabasePath, op: DisconnectOp, done: Completion<()>);

    fn go_online(&self);

    fn go_offline(&self);

    /// Release the native connection. Called once per instance.
    fn shutdown(&self);
}

/// Opens native connections for the instance registry.
pub trait Connector: Send + Sync {
    /// Connect to `url` on behalf of `app`, delivering listener events to `router`.
    fn connect(
        &self,
        app: &App,
        url: &str,
        router: Arc<EventRouter>,
    ) -> Result<Arc<dyn SyncService>>;
}
