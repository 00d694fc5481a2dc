//! Aggregate for child added/changed/moved/removed subscriptions.

use super::binding::{Binding, Registration};
use super::handlers::{DispatchList, Handler, HandlerSet};
use super::types::{ChildEvent, DispatchOutcome, EventKind, ListenerToken, NativeEvent};
use super::ListenerAggregate;
use crate::database::Database;
use crate::error::{BridgeError, Result};
use crate::query::QuerySpec;
use crate::service::ListenerKind;
use crate::types::{CallbackId, ChildChangeKind, InstanceId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

struct ChildState {
    added: HandlerSet<ChildEvent>,
    changed: HandlerSet<ChildEvent>,
    moved: HandlerSet<ChildEvent>,
    removed: HandlerSet<ChildEvent>,
    /// Present iff any of the sets is non-empty.
    registration: Option<Registration>,
}

impl ChildState {
    fn set(&self, kind: ChildChangeKind) -> &HandlerSet<ChildEvent> {
        match kind {
            ChildChangeKind::Added => &self.added,
            ChildChangeKind::Changed => &self.changed,
            ChildChangeKind::Moved => &self.moved,
            ChildChangeKind::Removed => &self.removed,
        }
    }

    fn set_mut(&mut self, kind: ChildChangeKind) -> &mut HandlerSet<ChildEvent> {
        match kind {
            ChildChangeKind::Added => &mut self.added,
            ChildChangeKind::Changed => &mut self.changed,
            ChildChangeKind::Moved => &mut self.moved,
            ChildChangeKind::Removed => &mut self.removed,
        }
    }

    fn len(&self) -> usize {
        self.added.len() + self.changed.len() + self.moved.len() + self.removed.len()
    }

    /// Everyone attached, for cancellation.
    fn all(&self) -> DispatchList<ChildEvent> {
        let mut list = DispatchList::new();
        list.extend(&self.added);
        list.extend(&self.changed);
        list.extend(&self.moved);
        list.extend(&self.removed);
        list
    }
}

/// Multiplexes child subscriptions on one query onto one native listener.
///
/// The native side reports a cancellation once per listener, so it goes to
/// subscribers of every kind.
pub struct ChildAggregate {
    binding: Binding,
    state: Mutex<ChildState>,
}

impl ChildAggregate {
    pub(crate) fn new(database: Arc<Database>, query: QuerySpec) -> Arc<Self> {
        Arc::new(Self {
            binding: Binding::new(database, query, ListenerKind::Child),
            state: Mutex::new(ChildState {
                added: HandlerSet::new(),
                changed: HandlerSet::new(),
                moved: HandlerSet::new(),
                removed: HandlerSet::new(),
                registration: None,
            }),
        })
    }

    pub(crate) fn add_subscriber(
        self: &Arc<Self>,
        kind: EventKind,
        handler: Handler<ChildEvent>,
    ) -> Result<ListenerToken> {
        let change = kind.child_change().ok_or_else(|| {
            BridgeError::InvalidQuery(
                "value subscriptions belong to the value aggregate".to_string(),
            )
        })?;

        let mut state = self.state.lock();
        if state.registration.is_none() {
            let aggregate: Arc<dyn ListenerAggregate> = self.clone();
            state.registration = Some(self.binding.attach(aggregate)?);
        }
        Ok(state.set_mut(change).insert(kind, handler))
    }

    pub(crate) fn remove_subscriber(&self, token: ListenerToken) -> bool {
        let Some(change) = token.kind.child_change() else {
            return false;
        };

        let mut state = self.state.lock();
        if !state.set_mut(change).remove(token) {
            return false;
        }
        if state.len() == 0 {
            if let Some(registration) = state.registration.take() {
                self.binding.detach(registration);
            }
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Subscribers for one change kind.
    pub fn subscriber_count_for(&self, kind: ChildChangeKind) -> usize {
        self.state.lock().set(kind).len()
    }

    pub fn callback_id(&self) -> Option<CallbackId> {
        self.state.lock().registration.as_ref().map(|r| r.callback_id)
    }
}

impl ListenerAggregate for ChildAggregate {
    fn kind(&self) -> ListenerKind {
        self.binding.kind()
    }

    fn instance(&self) -> InstanceId {
        self.binding.database().id()
    }

    fn dispatch(&self, callback_id: CallbackId, event: NativeEvent) -> DispatchOutcome {
        match event {
            NativeEvent::Child {
                kind,
                mut payload,
                previous_key,
            } => {
                let handlers = {
                    let state = self.state.lock();
                    if !is_current(&state, callback_id) {
                        return DispatchOutcome::stale();
                    }
                    state.set(kind).snapshot()
                };
                let Some(snapshot) = payload.take_snapshot() else {
                    return DispatchOutcome::stale();
                };
                let event = ChildEvent::change(kind, snapshot, previous_key);
                let outcome = handlers.invoke(&event);
                drop(payload);
                outcome
            }
            NativeEvent::Cancelled(error) => {
                let handlers = {
                    let state = self.state.lock();
                    if !is_current(&state, callback_id) {
                        return DispatchOutcome::stale();
                    }
                    state.all()
                };
                handlers.invoke(&ChildEvent::Cancelled { error })
            }
            NativeEvent::Value(_) => {
                warn!(callback_id = %callback_id, "value event routed to child listener");
                DispatchOutcome::stale()
            }
        }
    }

    fn detach_all(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.added.clear()
            + state.changed.clear()
            + state.moved.clear()
            + state.removed.clear();
        if let Some(registration) = state.registration.take() {
            self.binding.detach(registration);
        }
        removed
    }
}

fn is_current(state: &ChildState, callback_id: CallbackId) -> bool {
    matches!(&state.registration, Some(r) if r.callback_id == callback_id)
}
