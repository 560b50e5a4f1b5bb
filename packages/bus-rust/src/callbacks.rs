//! Correlation of outbound messages to pending completion handles.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use unicast_core::LogicalMessage;

/// Outcome delivered to a [`CallbackHandle`] by the correlation mechanism.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    /// Numeric return code (see `Dispatcher::return_code`); 0 for plain replies.
    pub error_code: i32,
    /// Reply messages, if any.
    pub messages: Vec<LogicalMessage>,
}

/// Errors observed while waiting on a [`CallbackHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    /// The registry entry was removed or replaced before completion.
    #[error("callback was removed before it completed")]
    Abandoned,
    #[error("callback did not complete within {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
}

type PendingMap = DashMap<String, oneshot::Sender<CompletionResult>>;

/// Pending result for one outbound message, returned by send operations.
///
/// Dropping the handle withdraws interest: its registry entry is evicted,
/// so fire-and-forget sends leave nothing behind.
#[derive(Debug)]
pub struct CallbackHandle {
    message_id: String,
    receiver: Option<oneshot::Receiver<CompletionResult>>,
    pending: Weak<PendingMap>,
}

impl CallbackHandle {
    /// Identifier of the physical message this handle is correlated with.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Waits until the correlation mechanism resolves this handle.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Abandoned`] if the registry entry is dropped
    /// without a result.
    pub async fn wait(mut self) -> Result<CompletionResult, CallbackError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(CallbackError::Abandoned);
        };
        receiver.await.map_err(|_| CallbackError::Abandoned)
    }

    /// Like [`CallbackHandle::wait`], bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::TimedOut`] when the bound elapses first.
    /// The registry entry is evicted when the bound elapses.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<CompletionResult, CallbackError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(CallbackError::Abandoned);
        };
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CallbackError::Abandoned),
            Err(_) => Err(CallbackError::TimedOut { timeout_ms }),
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        // Close our end first so `is_closed` identifies this handle's entry
        // and leaves a newer registration under the same id alone.
        drop(self.receiver.take());
        if let Some(pending) = self.pending.upgrade() {
            pending.remove_if(&self.message_id, |_, tx| tx.is_closed());
        }
    }
}

/// Thread-safe map from outbound message id to its pending completion.
///
/// Registering an id that is already present replaces the earlier entry
/// without complaint; the replaced handle then observes
/// [`CallbackError::Abandoned`].
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    pending: Arc<PendingMap>,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending completion for `message_id` and returns its handle.
    pub fn register(&self, message_id: impl Into<String>) -> CallbackHandle {
        let message_id = message_id.into();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.clone(), tx);
        CallbackHandle {
            message_id,
            receiver: Some(rx),
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Completes and removes the entry for `message_id`.
    ///
    /// Returns `false` if no entry existed, including when the handle was
    /// already dropped.
    pub fn resolve(&self, message_id: &str, result: CompletionResult) -> bool {
        match self.pending.remove(message_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `message_id` without completing it.
    pub fn remove(&self, message_id: &str) -> bool {
        self.pending.remove(message_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
