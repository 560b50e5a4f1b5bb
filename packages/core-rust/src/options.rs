//! Per-dispatch send options.

use std::time::{Duration, SystemTime};

use crate::address::Address;
use crate::transport_message::MessageIntent;

/// When a deferred message should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDelay {
    /// Deliver once this much time has elapsed after dispatch.
    After(Duration),
    /// Deliver at (or after) this absolute point in time.
    At(SystemTime),
}

/// Configuration bag for a single dispatch call.
///
/// Built with the consuming `with_*` methods and read-only once handed to
/// the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    destination: Option<Address>,
    correlation_id: Option<String>,
    reply_to: Option<Address>,
    intent: MessageIntent,
    delay: Option<DeliveryDelay>,
}

impl SendOptions {
    /// Point-to-point send to `destination`.
    #[must_use]
    pub fn to(destination: Address) -> Self {
        Self {
            destination: Some(destination),
            ..Self::unrouted(MessageIntent::Send)
        }
    }

    /// Send whose destination is still to be resolved from the message type.
    #[must_use]
    pub fn send() -> Self {
        Self::unrouted(MessageIntent::Send)
    }

    /// Fan-out publish; subscribers are resolved by the pipeline.
    #[must_use]
    pub fn publish() -> Self {
        Self::unrouted(MessageIntent::Publish)
    }

    /// Reply directed at the sender's reply-to address.
    #[must_use]
    pub fn reply(destination: Address) -> Self {
        Self {
            destination: Some(destination),
            ..Self::unrouted(MessageIntent::Reply)
        }
    }

    fn unrouted(intent: MessageIntent) -> Self {
        Self {
            destination: None,
            correlation_id: None,
            reply_to: None,
            intent,
            delay: None,
        }
    }

    #[must_use]
    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: Address) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: DeliveryDelay) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn destination(&self) -> Option<&Address> {
        self.destination.as_ref()
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&Address> {
        self.reply_to.as_ref()
    }

    #[must_use]
    pub fn intent(&self) -> MessageIntent {
        self.intent
    }

    #[must_use]
    pub fn delay(&self) -> Option<DeliveryDelay> {
        self.delay
    }
}
