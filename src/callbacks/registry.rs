//! Callback registry implementation.

use crate::listeners::ListenerAggregate;
use crate::types::{CallbackId, InstanceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Ids are unique across every registry in the process.
static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Maps callback ids to the aggregates that own them.
///
/// All access goes through a single mutex. No aggregate code runs while it
/// is held: lookups hand out a cloned `Arc` and release the lock.
pub struct CallbackRegistry {
    entries: Mutex<HashMap<CallbackId, Arc<dyn ListenerAggregate>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id for `aggregate` and take ownership of it.
    pub fn register(&self, aggregate: Arc<dyn ListenerAggregate>) -> CallbackId {
        let id = CallbackId(NEXT_CALLBACK_ID.fetch_add(1, Ordering::SeqCst));
        self.entries.lock().insert(id, aggregate);
        trace!(callback_id = %id, "registered listener aggregate");
        id
    }

    /// Look up the aggregate for `id`.
    pub fn resolve(&self, id: CallbackId) -> Option<Arc<dyn ListenerAggregate>> {
        self.entries.lock().get(&id).cloned()
    }

    /// Drop the mapping for `id`. Returns false if it was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let removed = self.entries.lock().remove(&id);
        if removed.is_some() {
            trace!(callback_id = %id, "unregistered listener aggregate");
        }
        // The aggregate may be released here, after the lock is gone.
        removed.is_some()
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registered aggregates that belong to `instance`.
    pub fn for_instance(&self, instance: InstanceId) -> Vec<Arc<dyn ListenerAggregate>> {
        self.entries
            .lock()
            .values()
            .filter(|aggregate| aggregate.instance() == instance)
            .cloned()
            .collect()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
