//! Native listener lifecycle shared by both aggregate kinds.

use super::ListenerAggregate;
use crate::database::Database;
use crate::error::Result;
use crate::query::QuerySpec;
use crate::service::{ListenerKind, NativeListener};
use crate::types::CallbackId;
use std::sync::Arc;
use tracing::debug;

/// A live native listener and the id it reports under.
pub(crate) struct Registration {
    pub(crate) callback_id: CallbackId,
    native: NativeListener,
}

/// Ties an aggregate to its query and database.
///
/// Holding the `Arc<Database>` keeps the instance, and with it the native
/// connection, alive for as long as the aggregate exists.
pub(crate) struct Binding {
    database: Arc<Database>,
    query: QuerySpec,
    kind: ListenerKind,
}

impl Binding {
    pub(crate) fn new(database: Arc<Database>, query: QuerySpec, kind: ListenerKind) -> Self {
        Self {
            database,
            query,
            kind,
        }
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub(crate) fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Register `aggregate` and create its native listener.
    ///
    /// The id is registered first because the service needs it to tag
    /// callbacks. On failure the registration is rolled back.
    pub(crate) fn attach(&self, aggregate: Arc<dyn ListenerAggregate>) -> Result<Registration> {
        self.database.ensure_active()?;

        let callbacks = self.database.callbacks();
        let callback_id = callbacks.register(aggregate);

        match self
            .database
            .service()
            .create_listener(&self.query, self.kind, callback_id)
        {
            Ok(native) => {
                debug!(
                    query = %self.query,
                    kind = ?self.kind,
                    callback_id = %callback_id,
                    native = native.raw(),
                    "created native listener"
                );
                Ok(Registration {
                    callback_id,
                    native,
                })
            }
            Err(e) => {
                callbacks.unregister(callback_id);
                Err(e.into())
            }
        }
    }

    /// Unregister and destroy. Events still queued for the old id are
    /// discarded by the router from this point on.
    pub(crate) fn detach(&self, registration: Registration) {
        let Registration {
            callback_id,
            native,
        } = registration;

        self.database.callbacks().unregister(callback_id);
        debug!(
            query = %self.query,
            kind = ?self.kind,
            callback_id = %callback_id,
            native = native.raw(),
            "destroying native listener"
        );
        self.database.service().destroy_listener(native);
    }
}
