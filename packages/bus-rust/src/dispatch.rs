//! Outbound dispatch: send, publish, subscribe, reply, defer, and the
//! operations on the message currently being processed.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use unicast_core::{
    headers, Address, BusMessage, DeliveryDelay, LogicalMessage, MessageIntent, MessageType,
    SendOptions, TransportMessage,
};

use crate::addresses::EndpointAddresses;
use crate::callbacks::{CallbackHandle, CallbackRegistry};
use crate::context::ProcessingContext;
use crate::error::BusError;
use crate::observer::{BusObserver, CompositeObserver};
use crate::predicates::{self, MessagePredicate, SubscriptionPredicates};
use crate::router::AddressRouter;
use crate::state::RunState;
use crate::traits::{MessageSender, PipelineInvoker, SendOutcome, SubscriptionManager};

/// Sub-scope of the master node address that fronts the site gateway.
pub const GATEWAY_SUB_SCOPE: &str = "gateway";

/// Entry point for every application-initiated dispatch.
///
/// All operations check that the bus has been started and report validation
/// failures to the caller. Nothing is retried here.
pub struct Dispatcher {
    pub(crate) addresses: Arc<EndpointAddresses>,
    pub(crate) router: Arc<AddressRouter>,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    pub(crate) pipeline: Arc<dyn PipelineInvoker>,
    pub(crate) sender: Arc<dyn MessageSender>,
    pub(crate) subscriptions: Option<Arc<dyn SubscriptionManager>>,
    pub(crate) predicates: Arc<SubscriptionPredicates>,
    pub(crate) observers: Arc<CompositeObserver>,
    pub(crate) state: Arc<RunState>,
    pub(crate) send_only: bool,
    pub(crate) runs_as_worker: bool,
    pub(crate) outgoing_headers: DashMap<String, String>,
}

impl Dispatcher {
    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Sends logical messages with caller-built options.
    ///
    /// When `options` carries no destination, it is resolved from the first
    /// message's type. A reply-to address defaults to the local address.
    /// Dropping the returned handle discards the pending callback.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotStarted`] before the bus has started.
    /// - [`BusError::NoMessages`] for an empty message list.
    /// - [`BusError::NoRoute`] if no destination resolves.
    /// - [`BusError::Pipeline`] if the send pipeline fails.
    pub async fn send_messages(
        &self,
        options: SendOptions,
        messages: Vec<LogicalMessage>,
    ) -> Result<CallbackHandle, BusError> {
        self.state.ensure_started()?;

        let first_type = messages
            .first()
            .map(|m| m.message_type.clone())
            .ok_or(BusError::NoMessages)?;

        let destination = match options.destination() {
            Some(destination) if !destination.is_undefined() => destination.clone(),
            _ => self.router.resolve(&first_type),
        };
        if destination.is_undefined() {
            return Err(BusError::no_route(&first_type));
        }

        let mut options = options.with_destination(destination);
        if options.reply_to().is_none() {
            if let Some(local) = self.addresses.local() {
                options = options.with_reply_to(local);
            }
        }

        let (outcome, sent) = self.invoke(&options, messages).await?;
        self.observers.on_messages_sent(&sent);
        Ok(self.callbacks.register(outcome.physical.id))
    }

    /// Sends `message` to the endpoint that owns its type.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::send_messages`].
    pub async fn send<T: BusMessage>(&self, message: &T) -> Result<CallbackHandle, BusError> {
        self.send_batch(std::slice::from_ref(message)).await
    }

    /// Sends every message in one dispatch, routed by the first message's type.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::send_messages`].
    pub async fn send_batch<T: BusMessage>(&self, messages: &[T]) -> Result<CallbackHandle, BusError> {
        let logical = LogicalMessage::create_multiple(messages)?;
        self.send_messages(SendOptions::send(), logical).await
    }

    /// Sends `message` to an explicit destination.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::send_messages`].
    pub async fn send_to<T: BusMessage>(
        &self,
        destination: Address,
        message: &T,
    ) -> Result<CallbackHandle, BusError> {
        let logical = vec![LogicalMessage::from_message(message)?];
        self.send_messages(SendOptions::to(destination), logical).await
    }

    /// Builds a `T` with [`Dispatcher::create_instance`] and sends it.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::send_messages`].
    pub async fn send_with<T, F>(&self, constructor: F) -> Result<CallbackHandle, BusError>
    where
        T: BusMessage + Default,
        F: FnOnce(&mut T),
    {
        self.send(&Self::create_instance(constructor)).await
    }

    /// Sends to this endpoint: to the master node when running as a worker,
    /// otherwise to the local address.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoMasterNode`] or [`BusError::NoLocalAddress`] if
    /// the relevant address is not configured; otherwise see
    /// [`Dispatcher::send_messages`].
    pub async fn send_local<T: BusMessage>(&self, message: &T) -> Result<CallbackHandle, BusError> {
        let destination = self.own_queue()?;
        let logical = vec![LogicalMessage::from_message(message)?];
        self.send_messages(SendOptions::to(destination), logical).await
    }

    /// Sends messages through the site gateway of the master node. The
    /// comma-joined site keys are stamped on the first message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoMasterNode`] without a master node address and
    /// [`BusError::NoMessages`] for an empty list.
    pub async fn send_to_sites<T: BusMessage>(
        &self,
        site_keys: &[&str],
        messages: &[T],
    ) -> Result<CallbackHandle, BusError> {
        let master = self.addresses.master().ok_or(BusError::NoMasterNode)?;
        let mut logical = LogicalMessage::create_multiple(messages)?;
        let first = logical.first_mut().ok_or(BusError::NoMessages)?;
        first
            .headers
            .insert(headers::DESTINATION_SITES.to_string(), site_keys.join(","));

        let gateway = master.sub_scope(GATEWAY_SUB_SCOPE);
        self.send_messages(SendOptions::to(gateway), logical).await
    }

    /// Sends messages to the local address for delivery after `delay`.
    ///
    /// The delayed-delivery mechanism itself belongs to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoLocalAddress`] without a local address;
    /// otherwise see [`Dispatcher::send_messages`].
    pub async fn defer<T: BusMessage>(
        &self,
        delay: DeliveryDelay,
        messages: &[T],
    ) -> Result<CallbackHandle, BusError> {
        let local = self.addresses.local().ok_or(BusError::NoLocalAddress)?;
        let logical = LogicalMessage::create_multiple(messages)?;
        let options = SendOptions::to(local).with_delay(delay);
        self.send_messages(options, logical).await
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Publishes `message` to every subscriber of its type.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::publish_messages`].
    pub async fn publish<T: BusMessage>(&self, message: &T) -> Result<(), BusError> {
        let logical = vec![LogicalMessage::from_message(message)?];
        self.publish_messages(logical).await
    }

    /// Publishes a batch. An empty batch publishes one `T::default()`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::publish_messages`].
    pub async fn publish_batch<T: BusMessage + Default>(&self, messages: &[T]) -> Result<(), BusError> {
        if messages.is_empty() {
            return self.publish(&T::default()).await;
        }
        let logical = LogicalMessage::create_multiple(messages)?;
        self.publish_messages(logical).await
    }

    /// Builds a `T` with [`Dispatcher::create_instance`] and publishes it.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::publish_messages`].
    pub async fn publish_with<T, F>(&self, constructor: F) -> Result<(), BusError>
    where
        T: BusMessage + Default,
        F: FnOnce(&mut T),
    {
        self.publish(&Self::create_instance(constructor)).await
    }

    /// Publishes logical messages. Finding no subscriber is not an error:
    /// observers get one no-subscribers notification carrying the first
    /// message instead.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotStarted`] before the bus has started.
    /// - [`BusError::NoMessages`] for an empty message list.
    /// - [`BusError::Pipeline`] if the send pipeline fails.
    pub async fn publish_messages(&self, messages: Vec<LogicalMessage>) -> Result<(), BusError> {
        self.state.ensure_started()?;
        if messages.is_empty() {
            return Err(BusError::NoMessages);
        }

        let (outcome, sent) = self.invoke(&SendOptions::publish(), messages).await?;
        if !outcome.subscribers_found {
            if let Some(first) = sent.first() {
                debug!(message_type = first.message_type.name(), "no subscribers for message");
                self.observers.on_no_subscribers(first);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribes to messages of type `T`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::subscribe_type`].
    pub async fn subscribe<T: BusMessage>(&self) -> Result<(), BusError> {
        self.subscribe_type(&T::message_type(), None).await
    }

    /// Subscribes to messages of type `T`, discarding received ones that do
    /// not satisfy `condition`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::subscribe_type`].
    pub async fn subscribe_where<T, F>(&self, condition: F) -> Result<(), BusError>
    where
        T: BusMessage + DeserializeOwned,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.subscribe_type(&T::message_type(), Some(predicates::typed(condition)))
            .await
    }

    /// Registers interest in `message_type` with the endpoint that owns it.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// 1. [`BusError::PubSubValidation`] for command types or a send-only endpoint.
    /// 2. [`BusError::NoLocalAddress`] without a local address.
    /// 3. [`BusError::SelfSubscription`] if this endpoint owns the type.
    /// 4. [`BusError::NoSubscriptionManager`] without a subscription manager.
    pub async fn subscribe_type(
        &self,
        message_type: &MessageType,
        condition: Option<MessagePredicate>,
    ) -> Result<(), BusError> {
        self.state.ensure_started()?;
        self.check_pub_sub(message_type, "a send-only endpoint cannot subscribe")?;
        let local = self.addresses.local().ok_or(BusError::NoLocalAddress)?;

        let publisher = self.router.resolve(message_type);
        if publisher == local {
            return Err(BusError::SelfSubscription {
                message_type: message_type.name().to_string(),
            });
        }

        let manager = self
            .subscriptions
            .as_ref()
            .ok_or(BusError::NoSubscriptionManager)?;
        manager
            .subscribe(message_type, &publisher)
            .await
            .map_err(BusError::Pipeline)?;

        if let Some(condition) = condition {
            self.predicates.add_condition(message_type, condition);
        }
        info!(message_type = message_type.name(), publisher = %publisher, "subscribed");
        Ok(())
    }

    /// Unsubscribes from messages of type `T`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::unsubscribe_type`].
    pub async fn unsubscribe<T: BusMessage>(&self) -> Result<(), BusError> {
        self.unsubscribe_type(&T::message_type()).await
    }

    /// Withdraws interest in `message_type`. Unsubscribing when not
    /// subscribed succeeds. Predicates added by earlier subscribes remain.
    ///
    /// # Errors
    ///
    /// Same checks as [`Dispatcher::subscribe_type`] except the
    /// self-subscription check.
    pub async fn unsubscribe_type(&self, message_type: &MessageType) -> Result<(), BusError> {
        self.state.ensure_started()?;
        self.check_pub_sub(message_type, "a send-only endpoint cannot unsubscribe")?;
        if self.addresses.local().is_none() {
            return Err(BusError::NoLocalAddress);
        }

        let publisher = self.router.resolve(message_type);
        let manager = self
            .subscriptions
            .as_ref()
            .ok_or(BusError::NoSubscriptionManager)?;
        manager
            .unsubscribe(message_type, &publisher)
            .await
            .map_err(BusError::Pipeline)?;

        info!(message_type = message_type.name(), publisher = %publisher, "unsubscribed");
        Ok(())
    }

    fn check_pub_sub(&self, message_type: &MessageType, send_only_reason: &'static str) -> Result<(), BusError> {
        if !message_type.is_valid_for_pub_sub() {
            return Err(BusError::pub_sub(
                message_type,
                "commands are sent point-to-point and cannot be subscribed to",
            ));
        }
        if self.send_only {
            return Err(BusError::pub_sub(message_type, send_only_reason));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Current message
    // -----------------------------------------------------------------------

    /// Replies to the sender of the message being processed.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::reply_batch`].
    pub async fn reply<T: BusMessage>(&self, ctx: &ProcessingContext, message: &T) -> Result<(), BusError> {
        self.reply_batch(ctx, std::slice::from_ref(message)).await
    }

    /// Replies with several messages in one dispatch. The reply is
    /// correlated with the current message's correlation id, or its id when
    /// it has none.
    ///
    /// # Errors
    ///
    /// - [`BusError::NoCurrentMessage`] outside message processing.
    /// - [`BusError::NoReplyAddress`] if the current message has no reply-to.
    /// - [`BusError::NoMessages`] for an empty list.
    /// - [`BusError::Pipeline`] if the send pipeline fails.
    pub async fn reply_batch<T: BusMessage>(
        &self,
        ctx: &ProcessingContext,
        messages: &[T],
    ) -> Result<(), BusError> {
        self.state.ensure_started()?;
        let current = ctx.current_message().ok_or(BusError::NoCurrentMessage)?;
        let reply_to = current
            .reply_to_address
            .clone()
            .ok_or(BusError::NoReplyAddress)?;

        let logical = LogicalMessage::create_multiple(messages)?;
        if logical.is_empty() {
            return Err(BusError::NoMessages);
        }

        let options =
            SendOptions::reply(reply_to).with_correlation_id(current.reply_correlation_id());
        let (_, sent) = self.invoke(&options, logical).await?;
        self.observers.on_messages_sent(&sent);
        Ok(())
    }

    /// Answers the current message with a numeric return code instead of a
    /// reply message.
    ///
    /// # Errors
    ///
    /// - [`BusError::NoCurrentMessage`] outside message processing.
    /// - [`BusError::NoReplyAddress`] if the current message has no reply-to.
    /// - [`BusError::Pipeline`] if the send pipeline fails.
    pub async fn return_code(&self, ctx: &ProcessingContext, code: i32) -> Result<(), BusError> {
        self.state.ensure_started()?;
        let current = ctx.current_message().ok_or(BusError::NoCurrentMessage)?;
        let reply_to = current
            .reply_to_address
            .clone()
            .ok_or(BusError::NoReplyAddress)?;

        let mut control = TransportMessage::control(self.addresses.local());
        control.intent = MessageIntent::Reply;
        control.correlation_id = Some(current.reply_correlation_id().to_string());
        control.set_header(headers::RETURN_MESSAGE_ERROR_CODE, code.to_string());

        let options = SendOptions::reply(reply_to);
        self.pipeline
            .invoke_send_control(&options, control)
            .await
            .map_err(BusError::Pipeline)?;
        Ok(())
    }

    /// Puts the current message back at the end of this endpoint's queue:
    /// the master node when running as a worker, otherwise the local address.
    /// Only the first call per processed message re-sends.
    ///
    /// # Errors
    ///
    /// - [`BusError::NoCurrentMessage`] outside message processing.
    /// - [`BusError::NoMasterNode`] / [`BusError::NoLocalAddress`] if the
    ///   target address is missing.
    /// - [`BusError::Transport`] if the re-send fails; a later call may retry.
    pub async fn handle_current_message_later(&self, ctx: &ProcessingContext) -> Result<(), BusError> {
        self.state.ensure_started()?;
        let current = ctx.current_message().ok_or(BusError::NoCurrentMessage)?;
        if !ctx.claim_handle_later() {
            debug!(message_id = %current.id, "message already scheduled to be handled later");
            return Ok(());
        }

        let result = match self.own_queue() {
            Ok(destination) => self
                .sender
                .send(current, &destination)
                .await
                .map_err(BusError::Transport),
            Err(e) => Err(e),
        };
        if result.is_err() {
            ctx.release_handle_later();
        }
        result
    }

    /// Re-sends the current message unchanged to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoCurrentMessage`] outside message processing and
    /// [`BusError::Transport`] if the send fails.
    pub async fn forward_current_message_to(
        &self,
        ctx: &ProcessingContext,
        destination: &Address,
    ) -> Result<(), BusError> {
        self.state.ensure_started()?;
        let current = ctx.current_message().ok_or(BusError::NoCurrentMessage)?;
        self.sender
            .send(current, destination)
            .await
            .map_err(BusError::Transport)
    }

    /// Stops the pipeline from invoking further handlers for the current
    /// message. Lifecycle hooks still run.
    pub fn abort_current_processing(&self, ctx: &ProcessingContext) {
        debug!(message_id = %ctx.message_id(), "aborting handler chain");
        ctx.abort();
    }

    // -----------------------------------------------------------------------
    // Local dispatch and helpers
    // -----------------------------------------------------------------------

    /// Hands `message` to local handlers in memory without touching the
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Pipeline`] if a handler fails.
    pub async fn raise<T: BusMessage>(&self, message: &T) -> Result<(), BusError> {
        self.state.ensure_started()?;
        let logical = LogicalMessage::from_message(message)?;
        self.pipeline
            .invoke_logical(logical)
            .await
            .map_err(BusError::Pipeline)
    }

    /// Builds `T::default()` and lets `constructor` fill it in.
    #[must_use]
    pub fn create_instance<T: Default>(constructor: impl FnOnce(&mut T)) -> T {
        let mut instance = T::default();
        constructor(&mut instance);
        instance
    }

    /// Adds a header stamped on every outbound logical message. A header the
    /// message already carries is left alone.
    pub fn set_outgoing_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing_headers.insert(key.into(), value.into());
    }

    /// Stops stamping `key` on outbound messages, returning its last value.
    pub fn remove_outgoing_header(&self, key: &str) -> Option<String> {
        self.outgoing_headers.remove(key).map(|(_, value)| value)
    }

    #[must_use]
    pub fn outgoing_headers(&self) -> BTreeMap<String, String> {
        self.outgoing_headers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Filters registered by `subscribe_where`, for the inbound pipeline.
    #[must_use]
    pub fn predicates(&self) -> &Arc<SubscriptionPredicates> {
        &self.predicates
    }

    fn own_queue(&self) -> Result<Address, BusError> {
        if self.runs_as_worker {
            self.addresses.master().ok_or(BusError::NoMasterNode)
        } else {
            self.addresses.local().ok_or(BusError::NoLocalAddress)
        }
    }

    async fn invoke(
        &self,
        options: &SendOptions,
        mut messages: Vec<LogicalMessage>,
    ) -> Result<(SendOutcome, Vec<LogicalMessage>), BusError> {
        if !self.outgoing_headers.is_empty() {
            let outgoing = self.outgoing_headers();
            for message in &mut messages {
                for (key, value) in &outgoing {
                    message
                        .headers
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }

        let sent = messages.clone();
        let outcome = self
            .pipeline
            .invoke_send(options, messages)
            .await
            .map_err(BusError::Pipeline)?;
        debug!(
            message_id = %outcome.physical.id,
            intent = ?options.intent(),
            count = sent.len(),
            "messages dispatched"
        );
        Ok((outcome, sent))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state.get())
            .field("send_only", &self.send_only)
            .field("runs_as_worker", &self.runs_as_worker)
            .field("pending_callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}
