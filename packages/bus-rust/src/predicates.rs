//! Subscriber-side filters for received published messages.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use unicast_core::{BusMessage, LogicalMessage, MessageType};

/// Message-level filter registered alongside a subscription.
pub type MessagePredicate = Arc<dyn Fn(&LogicalMessage) -> bool + Send + Sync>;

/// Wraps a typed predicate into a [`MessagePredicate`].
///
/// Messages of other types pass, as do bodies that do not decode as `T`;
/// only a decoded `T` is ever rejected.
pub fn typed<T, F>(predicate: F) -> MessagePredicate
where
    T: BusMessage + DeserializeOwned,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |message: &LogicalMessage| {
        if !message.is::<T>() {
            return true;
        }
        match message.decode::<T>() {
            Ok(decoded) => predicate(&decoded),
            Err(_) => true,
        }
    })
}

/// Conditions evaluated against received published messages. A message is
/// kept only if every condition registered for its type accepts it.
///
/// Conditions accumulate; unsubscribing does not remove them.
#[derive(Default)]
pub struct SubscriptionPredicates {
    conditions: DashMap<String, Vec<MessagePredicate>>,
}

impl SubscriptionPredicates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_condition(&self, message_type: &MessageType, predicate: MessagePredicate) {
        self.conditions
            .entry(message_type.name().to_string())
            .or_default()
            .push(predicate);
    }

    /// Returns `true` if `message` should be handed to local handlers.
    #[must_use]
    pub fn evaluate(&self, message: &LogicalMessage) -> bool {
        // Clone out so predicates never run under the shard lock.
        let conditions = match self.conditions.get(message.message_type.name()) {
            Some(entry) => entry.value().clone(),
            None => return true,
        };
        conditions.iter().all(|condition| condition(message))
    }

    #[must_use]
    pub fn has_conditions(&self, message_type: &MessageType) -> bool {
        self.conditions
            .get(message_type.name())
            .is_some_and(|entry| !entry.is_empty())
    }
}

impl std::fmt::Debug for SubscriptionPredicates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionPredicates")
            .field("types", &self.conditions.len())
            .finish()
    }
}
