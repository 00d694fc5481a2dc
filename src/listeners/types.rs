//! Event and token types for listener aggregates.

use crate::router::EventPayload;
use crate::service::ListenerKind;
use crate::types::{ChildChangeKind, DataSnapshot, ServiceError};
use serde::{Deserialize, Serialize};

/// Event delivered to value subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueEvent {
    /// The data at the query changed.
    Changed { snapshot: DataSnapshot },
    /// The service cancelled the listener (e.g. permission denied).
    Cancelled { error: ServiceError },
}

impl ValueEvent {
    pub fn snapshot(&self) -> Option<&DataSnapshot> {
        match self {
            ValueEvent::Changed { snapshot } => Some(snapshot),
            ValueEvent::Cancelled { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ServiceError> {
        match self {
            ValueEvent::Changed { .. } => None,
            ValueEvent::Cancelled { error } => Some(error),
        }
    }
}

/// Event delivered to child subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildEvent {
    Added {
        snapshot: DataSnapshot,
        previous_key: Option<String>,
    },
    Changed {
        snapshot: DataSnapshot,
        previous_key: Option<String>,
    },
    Moved {
        snapshot: DataSnapshot,
        previous_key: Option<String>,
    },
    Removed {
        snapshot: DataSnapshot,
    },
    /// Delivered to every child subscriber regardless of kind.
    Cancelled {
        error: ServiceError,
    },
}

impl ChildEvent {
    pub(crate) fn change(
        kind: ChildChangeKind,
        snapshot: DataSnapshot,
        previous_key: Option<String>,
    ) -> Self {
        match kind {
            ChildChangeKind::Added => ChildEvent::Added {
                snapshot,
                previous_key,
            },
            ChildChangeKind::Changed => ChildEvent::Changed {
                snapshot,
                previous_key,
            },
            ChildChangeKind::Moved => ChildEvent::Moved {
                snapshot,
                previous_key,
            },
            ChildChangeKind::Removed => ChildEvent::Removed { snapshot },
        }
    }

    pub fn snapshot(&self) -> Option<&DataSnapshot> {
        match self {
            ChildEvent::Added { snapshot, .. }
            | ChildEvent::Changed { snapshot, .. }
            | ChildEvent::Moved { snapshot, .. }
            | ChildEvent::Removed { snapshot } => Some(snapshot),
            ChildEvent::Cancelled { .. } => None,
        }
    }

    pub fn previous_key(&self) -> Option<&str> {
        match self {
            ChildEvent::Added { previous_key, .. }
            | ChildEvent::Changed { previous_key, .. }
            | ChildEvent::Moved { previous_key, .. } => previous_key.as_deref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ServiceError> {
        match self {
            ChildEvent::Cancelled { error } => Some(error),
            _ => None,
        }
    }

    /// Change kind, `None` for cancellation.
    pub fn kind(&self) -> Option<ChildChangeKind> {
        match self {
            ChildEvent::Added { .. } => Some(ChildChangeKind::Added),
            ChildEvent::Changed { .. } => Some(ChildChangeKind::Changed),
            ChildEvent::Moved { .. } => Some(ChildChangeKind::Moved),
            ChildEvent::Removed { .. } => Some(ChildChangeKind::Removed),
            ChildEvent::Cancelled { .. } => None,
        }
    }
}

/// The events a subscriber can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Value,
    ChildAdded,
    ChildChanged,
    ChildMoved,
    ChildRemoved,
}

impl EventKind {
    /// Native listener flavour that serves this event.
    pub fn listener_kind(self) -> ListenerKind {
        match self {
            EventKind::Value => ListenerKind::Value,
            _ => ListenerKind::Child,
        }
    }

    pub(crate) fn child_change(self) -> Option<ChildChangeKind> {
        match self {
            EventKind::Value => None,
            EventKind::ChildAdded => Some(ChildChangeKind::Added),
            EventKind::ChildChanged => Some(ChildChangeKind::Changed),
            EventKind::ChildMoved => Some(ChildChangeKind::Moved),
            EventKind::ChildRemoved => Some(ChildChangeKind::Removed),
        }
    }
}

/// Identifies one subscription; returned on subscribe, taken on removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    pub(crate) id: u64,
    pub(crate) kind: EventKind,
}

impl ListenerToken {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// A native event on its way to an aggregate.
#[derive(Debug)]
pub enum NativeEvent {
    Value(EventPayload),
    Child {
        kind: ChildChangeKind,
        payload: EventPayload,
        previous_key: Option<String>,
    },
    Cancelled(ServiceError),
}

/// What happened to one routed event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub delivered: usize,
    /// The event did not belong to the aggregate's current registration.
    pub stale: bool,
    /// Panic messages from handlers that failed.
    pub failures: Vec<String>,
}

impl DispatchOutcome {
    pub(crate) fn stale() -> Self {
        Self {
            stale: true,
            ..Default::default()
        }
    }
}
