//! Ordered handler collections with token-based removal.

use super::types::{DispatchOutcome, EventKind, ListenerToken};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Closure type for subscribers.
pub(crate) type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct Entry<E> {
    token: ListenerToken,
    handler: Handler<E>,
    /// Cleared on removal; dispatch checks it right before invoking.
    active: Arc<AtomicBool>,
}

/// Subscribers for one event kind, in subscription order.
pub(crate) struct HandlerSet<E> {
    entries: Vec<Entry<E>>,
}

impl<E> HandlerSet<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, kind: EventKind, handler: Handler<E>) -> ListenerToken {
        let token = ListenerToken {
            id: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        self.entries.push(Entry {
            token,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });
        token
    }

    /// Remove the subscription for `token`. Unknown tokens are ignored.
    pub(crate) fn remove(&mut self, token: ListenerToken) -> bool {
        match self.entries.iter().position(|e| e.token == token) {
            Some(index) => {
                let entry = self.entries.remove(index);
                entry.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Remove everything, returning how many subscriptions were dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.active.store(false, Ordering::SeqCst);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cheap copy of the current handlers for use outside the lock.
    pub(crate) fn snapshot(&self) -> DispatchList<E> {
        let mut list = DispatchList::new();
        list.extend(self);
        list
    }
}

/// Handlers captured for one dispatch.
pub(crate) struct DispatchList<E> {
    entries: Vec<(Handler<E>, Arc<AtomicBool>)>,
}

impl<E> DispatchList<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn extend(&mut self, set: &HandlerSet<E>) {
        self.entries.extend(
            set.entries
                .iter()
                .map(|e| (Arc::clone(&e.handler), Arc::clone(&e.active))),
        );
    }

    /// Run every still-active handler. Must be called without locks held.
    pub(crate) fn invoke(&self, event: &E) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for (handler, active) in &self.entries {
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => outcome.delivered += 1,
                Err(panic) => outcome.failures.push(panic_message(panic.as_ref())),
            }
        }
        outcome
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
