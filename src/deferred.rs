//! Deferred results for asynchronous data operations.
//!
//! The native service completes operations on its own threads. The
//! completion side ([`Completer`]) sends the outcome over a one-slot channel
//! and the caller collects it on whatever thread it likes.

use crate::error::{BridgeError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Create a linked completer/deferred pair.
pub(crate) fn channel<T>() -> (Completer<T>, Deferred<T>) {
    let (sender, receiver) = bounded(1);
    (Completer { sender }, Deferred { receiver })
}

/// Sending half, moved into the service's completion callback.
pub(crate) struct Completer<T> {
    sender: Sender<Result<T>>,
}

impl<T> Completer<T> {
    /// Deliver the outcome. A caller that stopped waiting is not an error.
    pub(crate) fn complete(self, result: Result<T>) {
        let _ = self.sender.try_send(result);
    }
}

/// Result of an asynchronous operation that may not have finished yet.
///
/// If the service drops the completion without calling it, waiting yields
/// [`BridgeError::Abandoned`].
pub struct Deferred<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> Deferred<T> {
    /// An already completed result.
    pub fn ready(result: Result<T>) -> Self {
        let (completer, deferred) = channel();
        completer.complete(result);
        deferred
    }

    /// Block until the operation completes.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().unwrap_or(Err(BridgeError::Abandoned))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Abandoned),
        }
    }

    /// Take the result if it is already available.
    pub fn try_result(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(BridgeError::Abandoned)),
        }
    }

    /// True once a result is waiting to be taken.
    pub fn is_complete(&self) -> bool {
        !self.receiver.is_empty()
    }
}
