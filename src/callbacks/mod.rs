//! Indirection table between native callback ids and listener aggregates.
//!
//! The native service never holds a reference to anything on this side of the
//! boundary. It tags every listener callback with a [`CallbackId`] and the
//! [`EventRouter`](crate::router::EventRouter) resolves that id here. An
//! aggregate is present in the table exactly while it has at least one
//! subscriber, and presence in the table is what keeps it alive.
//!
//! [`CallbackId`]: crate::types::CallbackId

mod registry;

pub use registry::CallbackRegistry;
