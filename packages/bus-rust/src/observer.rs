//! Bus notification observers and the composite fan-out.
//!
//! Defines [`BusObserver`] for reacting to outward bus notifications and
//! [`CompositeObserver`] which fans each notification out to every
//! registered observer. Notifications are fire-and-forget.

use std::sync::Arc;

use parking_lot::RwLock;
use unicast_core::{LogicalMessage, TransportMessage};

/// Observer for bus notifications.
///
/// Every method defaults to a no-op, so implementations override only the
/// notifications they care about. Used as `Arc<dyn BusObserver>`.
pub trait BusObserver: Send + Sync {
    /// Called after a send completes, with the logical messages that went out.
    fn on_messages_sent(&self, _messages: &[LogicalMessage]) {}

    /// Called when a publish found no subscribers, with its first message.
    fn on_no_subscribers(&self, _message: &LogicalMessage) {}

    /// Called once per successful bus start.
    fn on_bus_started(&self) {}

    /// Called for each received message before the inbound pipeline runs.
    fn on_message_received(&self, _message: &TransportMessage) {}
}

/// Composite observer that fans out to every registered observer.
#[derive(Default)]
pub struct CompositeObserver {
    observers: RwLock<Vec<Arc<dyn BusObserver>>>,
}

impl CompositeObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn BusObserver>>) -> Self {
        Self {
            observers: RwLock::new(observers),
        }
    }

    /// Adds an observer after construction.
    pub fn add(&self, observer: Arc<dyn BusObserver>) {
        self.observers.write().push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    // Observers may register further observers from a callback, so the list
    // is snapshotted rather than iterated under the lock.
    fn snapshot(&self) -> Vec<Arc<dyn BusObserver>> {
        self.observers.read().clone()
    }
}

impl BusObserver for CompositeObserver {
    fn on_messages_sent(&self, messages: &[LogicalMessage]) {
        for observer in self.snapshot() {
            observer.on_messages_sent(messages);
        }
    }

    fn on_no_subscribers(&self, message: &LogicalMessage) {
        for observer in self.snapshot() {
            observer.on_no_subscribers(message);
        }
    }

    fn on_bus_started(&self) {
        for observer in self.snapshot() {
            observer.on_bus_started();
        }
    }

    fn on_message_received(&self, message: &TransportMessage) {
        for observer in self.snapshot() {
            observer.on_message_received(message);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use unicast_core::MessageType;

    use super::*;
    use crate::test_support::RecordingObserver;

    #[test]
    fn fans_out_to_every_observer() {
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());
        let composite = CompositeObserver::new(vec![first.clone()]);
        composite.add(second.clone());
        assert_eq!(composite.len(), 2);

        let message = LogicalMessage::new(MessageType::event("OrderPlaced"), serde_json::json!({}));
        composite.on_bus_started();
        composite.on_no_subscribers(&message);
        composite.on_messages_sent(std::slice::from_ref(&message));
        composite.on_message_received(&TransportMessage::with_id("msg-1"));

        for observer in [&first, &second] {
            assert_eq!(observer.bus_started(), 1);
            assert_eq!(observer.no_subscribers().len(), 1);
            assert_eq!(observer.sent().len(), 1);
            assert_eq!(observer.received(), vec!["msg-1".to_string()]);
        }
    }

    #[test]
    fn empty_composite_is_a_no_op() {
        let composite = CompositeObserver::default();
        assert!(composite.is_empty());
        composite.on_bus_started();
    }
}
