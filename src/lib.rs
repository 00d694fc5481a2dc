//! # RTDB Bridge
//!
//! Listener and lifetime coordination between user code and a native
//! realtime database sync service.
//!
//! ## Core Concepts
//!
//! - **Callback ids**: The native side only ever sees integer ids; the
//!   [`CallbackRegistry`] maps them back to live listener aggregates
//! - **Listener aggregates**: Many user subscriptions on one query share one
//!   native listener, created on first subscribe and destroyed on last
//!   unsubscribe
//! - **Event router**: Entry points the service calls with an id and a
//!   payload; unresolvable ids are dropped safely
//! - **Instances**: One [`Database`] per (app, URL), kept alive by every
//!   query, listener and in-flight operation that uses it
//!
//! ## Example
//!
//! ```ignore
//! use rtdb_bridge::{App, AppOptions, DatabaseRegistry, MemoryConnector};
//! use std::sync::Arc;
//!
//! let registry = DatabaseRegistry::new(Arc::new(MemoryConnector::default()));
//! let app = App::with_defaults(AppOptions {
//!     database_url: Some("https://demo.example.com".into()),
//! });
//! let database = registry.get_default_instance(&app)?;
//!
//! let games = database.reference("games")?;
//! let token = games.on_value(|event| println!("{:?}", event.snapshot()))?;
//! games.child("g1")?.set_value(serde_json::json!({"score": 3})).wait()?;
//! games.remove_listener(token);
//! ```

pub mod app;
pub mod callbacks;
pub mod database;
pub mod deferred;
pub mod error;
pub mod listeners;
pub mod query;
pub mod router;
pub mod service;
pub mod types;

// Re-exports
pub use app::{App, AppId, AppOptions, HookId, DEFAULT_APP_NAME};
pub use callbacks::CallbackRegistry;
pub use database::{Database, DatabaseRegistry, RegistryConfig};
pub use deferred::Deferred;
pub use error::{BridgeError, Result};
pub use listeners::{
    ChildAggregate, ChildEvent, EventKind, ListenerAggregate, ListenerToken, ValueAggregate,
    ValueEvent,
};
pub use query::{
    DatabaseReference, Limit, OnDisconnect, OrderBy, Query, QueryBound, QueryParams, QuerySpec,
    QueryValue,
};
pub use router::{EventPayload, EventRouter, HandlerFailure, RouterConfig, RouterStats};
pub use service::{
    Connector, DisconnectOp, ListenerKind, MemoryConnector, MemoryServiceConfig,
    MemoryServiceStats, MemorySyncService, NativeListener, SyncService,
};
pub use types::*;
