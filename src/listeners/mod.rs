//! Listener aggregates: many user subscriptions, one native listener.
//!
//! Every query owns at most one [`ValueAggregate`] and one
//! [`ChildAggregate`]. The first subscriber registers the aggregate with the
//! [`CallbackRegistry`](crate::callbacks::CallbackRegistry) and asks the
//! native service for a listener; the last one to leave destroys that
//! listener and unregisters, all under the aggregate's lock.
//!
//! Dispatch snapshots the handler set under the same lock and runs the
//! handlers after releasing it, so a handler may subscribe or unsubscribe
//! from inside its own callback. A handler removed while a dispatch is in
//! flight is skipped by that dispatch if it has not been reached yet.
//!
//! # Example
//!
//! ```ignore
//! let games = database.reference("games")?;
//! let token = games.on_child_added(|event| {
//!     if let Some(snapshot) = event.snapshot() {
//!         println!("new game {:?}", snapshot.key());
//!     }
//! })?;
//! // ...
//! games.remove_listener(token);
//! ```

mod binding;
mod child;
mod handlers;
mod types;
mod value;

pub use child::ChildAggregate;
pub use types::{ChildEvent, DispatchOutcome, EventKind, ListenerToken, NativeEvent, ValueEvent};
pub use value::ValueAggregate;

pub(crate) use handlers::panic_message;

use crate::service::ListenerKind;
use crate::types::{CallbackId, InstanceId};

/// What the callback registry stores and the router dispatches into.
pub trait ListenerAggregate: Send + Sync {
    fn kind(&self) -> ListenerKind;

    /// Database instance whose service owns the native listener.
    fn instance(&self) -> InstanceId;

    /// Deliver a native event tagged with `callback_id`.
    ///
    /// Events whose id is not the aggregate's current registration are
    /// reported as stale and not delivered.
    fn dispatch(&self, callback_id: CallbackId, event: NativeEvent) -> DispatchOutcome;

    /// Remove every subscriber and tear down the native listener.
    /// Returns the number of subscribers removed.
    fn detach_all(&self) -> usize;
}
