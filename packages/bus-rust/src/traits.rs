//! Collaborator contracts consumed by the bus.
//!
//! The pipeline, subscription storage, and raw message delivery live outside
//! this crate. The bus is handed implementations at construction time and
//! talks to them only through these traits.

use async_trait::async_trait;
use unicast_core::{Address, LogicalMessage, MessageType, SendOptions, TransportMessage};

use crate::context::{ChainControl, ProcessingContext};

/// Result of one send-pipeline invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    /// The envelope the pipeline produced and handed to the transport.
    pub physical: TransportMessage,
    /// For publishes: whether at least one subscriber received the message.
    /// Always `true` for point-to-point sends.
    pub subscribers_found: bool,
}

/// Executes the outbound and inbound message pipelines.
///
/// Every call completes before returning; `send`, `publish`, and `reply`
/// suspend the calling task for its full duration.
#[async_trait]
pub trait PipelineInvoker: Send + Sync {
    /// Serializes and dispatches logical messages.
    async fn invoke_send(
        &self,
        options: &SendOptions,
        messages: Vec<LogicalMessage>,
    ) -> anyhow::Result<SendOutcome>;

    /// Dispatches a pre-built control envelope (no logical body).
    async fn invoke_send_control(
        &self,
        options: &SendOptions,
        message: TransportMessage,
    ) -> anyhow::Result<SendOutcome>;

    /// Runs the inbound pipeline for the message in `ctx`.
    ///
    /// Implementations check [`ProcessingContext::chain_control`] between
    /// handlers and report whether the chain ran to completion.
    async fn invoke_physical(&self, ctx: &ProcessingContext) -> anyhow::Result<ChainControl>;

    /// Dispatches a logical message to local handlers in memory.
    async fn invoke_logical(&self, message: LogicalMessage) -> anyhow::Result<()>;
}

/// Subscription storage.
///
/// `publisher` is the endpoint that owns `message_type`, as resolved by the
/// router; the manager records this endpoint's interest with it.
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    async fn subscribe(&self, message_type: &MessageType, publisher: &Address) -> anyhow::Result<()>;

    /// Removing an absent subscription succeeds.
    async fn unsubscribe(&self, message_type: &MessageType, publisher: &Address) -> anyhow::Result<()>;
}

/// Raw envelope delivery, bypassing the send pipeline.
///
/// Used to re-deliver an already-received message unchanged.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: TransportMessage, destination: &Address) -> anyhow::Result<()>;
}
