//! Entry points invoked by the native service for listener events.
//!
//! Every native callback lands here with the [`CallbackId`] it was tagged
//! with. The router takes ownership of the payload, resolves the id through
//! the [`CallbackRegistry`] and hands the event to the owning aggregate. An
//! id that no longer resolves means the aggregate lost its last subscriber;
//! the payload is dropped, which releases its native resources.
//!
//! Panics raised by user handlers never unwind back into the service. They
//! are caught, counted, logged and published on the [`failures`] channel.
//!
//! [`failures`]: EventRouter::failures

use crate::callbacks::CallbackRegistry;
use crate::listeners::{panic_message, DispatchOutcome, NativeEvent};
use crate::types::{CallbackId, ChildChangeKind, DataSnapshot, ServiceError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default capacity of the handler failure side channel.
const DEFAULT_FAILURE_BUFFER: usize = 256;

/// Router configuration.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Failures buffered before new ones are dropped.
    /// Default: 256
    pub failure_buffer_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_buffer_size: DEFAULT_FAILURE_BUFFER,
        }
    }
}

/// Snapshot data received from the native side, plus the hook that frees
/// the native copy.
///
/// The hook runs when the payload is dropped, whether or not it was
/// dispatched.
pub struct EventPayload {
    snapshot: Option<DataSnapshot>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl EventPayload {
    /// Payload with no native resources attached.
    pub fn new(snapshot: DataSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            release: None,
        }
    }

    /// Payload that runs `release` once it is dropped.
    pub fn with_release(snapshot: DataSnapshot, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            snapshot: Some(snapshot),
            release: Some(Box::new(release)),
        }
    }

    pub fn snapshot(&self) -> Option<&DataSnapshot> {
        self.snapshot.as_ref()
    }

    /// Move the snapshot out. The release hook still runs on drop.
    pub fn take_snapshot(&mut self) -> Option<DataSnapshot> {
        self.snapshot.take()
    }
}

impl Drop for EventPayload {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPayload")
            .field("snapshot", &self.snapshot)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// A user handler that panicked during dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    pub callback_id: CallbackId,
    pub message: String,
}

/// Counters for routed events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Events handed to a live aggregate.
    pub dispatched: u64,
    /// Events discarded because their id no longer resolved.
    pub unroutable: u64,
    /// Handler panics caught at the boundary.
    pub handler_failures: u64,
}

/// Routes native listener callbacks to listener aggregates.
pub struct EventRouter {
    callbacks: Arc<CallbackRegistry>,
    failures_tx: Sender<HandlerFailure>,
    failures_rx: Receiver<HandlerFailure>,
    dispatched: AtomicU64,
    unroutable: AtomicU64,
    handler_failures: AtomicU64,
}

impl EventRouter {
    pub fn new(callbacks: Arc<CallbackRegistry>, config: RouterConfig) -> Self {
        let (failures_tx, failures_rx) = bounded(config.failure_buffer_size);
        Self {
            callbacks,
            failures_tx,
            failures_rx,
            dispatched: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Registry this router resolves ids against.
    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    // --- Native entry points ---

    pub fn on_value_changed(&self, callback_id: CallbackId, payload: EventPayload) {
        self.route(callback_id, NativeEvent::Value(payload));
    }

    pub fn on_child_changed(
        &self,
        callback_id: CallbackId,
        kind: ChildChangeKind,
        payload: EventPayload,
        previous_key: Option<String>,
    ) {
        self.route(
            callback_id,
            NativeEvent::Child {
                kind,
                payload,
                previous_key,
            },
        );
    }

    pub fn on_child_removed(&self, callback_id: CallbackId, payload: EventPayload) {
        self.route(
            callback_id,
            NativeEvent::Child {
                kind: ChildChangeKind::Removed,
                payload,
                previous_key: None,
            },
        );
    }

    /// Listener cancelled by the service; `code` is the raw native error code.
    pub fn on_cancelled(&self, callback_id: CallbackId, code: i32, message: &str) {
        self.route(
            callback_id,
            NativeEvent::Cancelled(ServiceError::from_native(code, message)),
        );
    }

    // --- Diagnostics ---

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            unroutable: self.unroutable.load(Ordering::SeqCst),
            handler_failures: self.handler_failures.load(Ordering::SeqCst),
        }
    }

    /// Receiver for handler failures caught during dispatch.
    pub fn failures(&self) -> Receiver<HandlerFailure> {
        self.failures_rx.clone()
    }

    fn route(&self, callback_id: CallbackId, event: NativeEvent) {
        let Some(aggregate) = self.callbacks.resolve(callback_id) else {
            self.unroutable.fetch_add(1, Ordering::SeqCst);
            debug!(callback_id = %callback_id, "discarding event for unregistered callback");
            // Payload dropped here, releasing the native copy.
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| aggregate.dispatch(callback_id, event)))
            .unwrap_or_else(|panic| DispatchOutcome {
                failures: vec![panic_message(panic.as_ref())],
                ..Default::default()
            });

        if outcome.stale {
            self.unroutable.fetch_add(1, Ordering::SeqCst);
            debug!(callback_id = %callback_id, "discarding stale event");
        } else {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
        }

        for message in outcome.failures {
            self.report_failure(callback_id, message);
        }
    }

    fn report_failure(&self, callback_id: CallbackId, message: String) {
        self.handler_failures.fetch_add(1, Ordering::SeqCst);
        error!(callback_id = %callback_id, %message, "listener handler panicked");

        match self.failures_tx.try_send(HandlerFailure {
            callback_id,
            message,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("handler failure buffer full, dropping failure report");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabasePath;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn router() -> EventRouter {
        EventRouter::new(Arc::new(CallbackRegistry::new()), RouterConfig::default())
    }

    fn payload(released: &Arc<AtomicUsize>) -> EventPayload {
        let released = Arc::clone(released);
        EventPayload::with_release(DataSnapshot::new(DatabasePath::root(), json!(1)), move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_unroutable_payload_is_released() {
        let router = router();
        let released = Arc::new(AtomicUsize::new(0));

        router.on_value_changed(CallbackId(999_999), payload(&released));
        router.on_child_removed(CallbackId(999_999), payload(&released));
        router.on_cancelled(CallbackId(999_999), -3, "permission denied");

        assert_eq!(released.load(Ordering::SeqCst), 2);
        let stats = router.stats();
        assert_eq!(stats.unroutable, 3);
        assert_eq!(stats.dispatched, 0);
    }

    #[test]
    fn test_payload_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut p = payload(&released);
        assert!(p.take_snapshot().is_some());
        assert!(p.take_snapshot().is_none());
        drop(p);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
