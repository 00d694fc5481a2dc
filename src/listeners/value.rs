//! Aggregate for value-changed subscriptions.

use super::binding::{Binding, Registration};
use super::handlers::{Handler, HandlerSet};
use super::types::{DispatchOutcome, EventKind, ListenerToken, NativeEvent, ValueEvent};
use super::ListenerAggregate;
use crate::database::Database;
use crate::error::Result;
use crate::query::QuerySpec;
use crate::service::ListenerKind;
use crate::types::{CallbackId, InstanceId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

struct ValueState {
    handlers: HandlerSet<ValueEvent>,
    /// Present iff `handlers` is non-empty.
    registration: Option<Registration>,
}

/// Multiplexes value subscriptions on one query onto one native listener.
pub struct ValueAggregate {
    binding: Binding,
    state: Mutex<ValueState>,
}

impl ValueAggregate {
    pub(crate) fn new(database: Arc<Database>, query: QuerySpec) -> Arc<Self> {
        Arc::new(Self {
            binding: Binding::new(database, query, ListenerKind::Value),
            state: Mutex::new(ValueState {
                handlers: HandlerSet::new(),
                registration: None,
            }),
        })
    }

    /// Add a subscriber, creating the native listener if it is the first.
    pub(crate) fn add_subscriber(
        self: &Arc<Self>,
        handler: Handler<ValueEvent>,
    ) -> Result<ListenerToken> {
        let mut state = self.state.lock();
        if state.registration.is_none() {
            let aggregate: Arc<dyn ListenerAggregate> = self.clone();
            state.registration = Some(self.binding.attach(aggregate)?);
        }
        Ok(state.handlers.insert(EventKind::Value, handler))
    }

    /// Remove a subscriber. The last one out destroys the native listener
    /// before this returns.
    pub(crate) fn remove_subscriber(&self, token: ListenerToken) -> bool {
        let mut state = self.state.lock();
        if !state.handlers.remove(token) {
            return false;
        }
        if state.handlers.is_empty() {
            if let Some(registration) = state.registration.take() {
                self.binding.detach(registration);
            }
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Id the native listener currently reports under.
    pub fn callback_id(&self) -> Option<CallbackId> {
        self.state.lock().registration.as_ref().map(|r| r.callback_id)
    }
}

impl ListenerAggregate for ValueAggregate {
    fn kind(&self) -> ListenerKind {
        self.binding.kind()
    }

    fn instance(&self) -> InstanceId {
        self.binding.database().id()
    }

    fn dispatch(&self, callback_id: CallbackId, event: NativeEvent) -> DispatchOutcome {
        let handlers = {
            let state = self.state.lock();
            match &state.registration {
                Some(registration) if registration.callback_id == callback_id => {}
                _ => return DispatchOutcome::stale(),
            }
            state.handlers.snapshot()
        };

        // The payload lives until handlers return, then releases its native copy.
        let (event, _payload) = match event {
            NativeEvent::Value(mut payload) => match payload.take_snapshot() {
                Some(snapshot) => (ValueEvent::Changed { snapshot }, Some(payload)),
                None => return DispatchOutcome::stale(),
            },
            NativeEvent::Cancelled(error) => (ValueEvent::Cancelled { error }, None),
            NativeEvent::Child { kind, .. } => {
                warn!(callback_id = %callback_id, ?kind, "child event routed to value listener");
                return DispatchOutcome::stale();
            }
        };

        handlers.invoke(&event)
    }

    fn detach_all(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.handlers.clear();
        if let Some(registration) = state.registration.take() {
            self.binding.detach(registration);
        }
        removed
    }
}
