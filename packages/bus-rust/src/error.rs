//! Errors surfaced synchronously by bus operations.

use unicast_core::MessageType;

/// Failures reported to the immediate caller of a bus operation.
///
/// Background failures (participant start/stop, end/error hooks) never
/// appear here; they are logged where they happen.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("the bus is not started yet, call Bus::start() before attempting to use the bus")]
    NotStarted,
    #[error("no destination could be found for message type {message_type}")]
    NoRoute { message_type: String },
    #[error("message type {message_type} is not valid for pub/sub: {reason}")]
    PubSubValidation {
        message_type: String,
        reason: &'static str,
    },
    #[error("no local address is configured for this endpoint")]
    NoLocalAddress,
    #[error("message {message_type} is owned by this endpoint and cannot be subscribed to")]
    SelfSubscription { message_type: String },
    #[error("no subscription manager is available")]
    NoSubscriptionManager,
    #[error("no message is currently being processed")]
    NoCurrentMessage,
    #[error("the current message has no reply-to address")]
    NoReplyAddress,
    #[error("cannot send an empty set of messages")]
    NoMessages,
    #[error("no master node address is configured")]
    NoMasterNode,
    #[error("addresses cannot be changed once the bus has started")]
    AddressFrozen,
    #[error("lifecycle hook '{hook}' failed while beginning message processing")]
    HookFailure {
        hook: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("startup action failed: {0}")]
    StartupAction(#[source] anyhow::Error),
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("pipeline error: {0}")]
    Pipeline(#[source] anyhow::Error),
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl BusError {
    pub(crate) fn no_route(message_type: &MessageType) -> Self {
        Self::NoRoute {
            message_type: message_type.name().to_string(),
        }
    }

    pub(crate) fn pub_sub(message_type: &MessageType, reason: &'static str) -> Self {
        Self::PubSubValidation {
            message_type: message_type.name().to_string(),
            reason,
        }
    }
}
