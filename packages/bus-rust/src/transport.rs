//! Transport contract and the in-memory loopback transport.
//!
//! A transport owns the receive loop. For each inbound envelope it creates a
//! [`ProcessingContext`] and raises four events on every registered
//! listener: processing started, message received, then either processing
//! finished or processing failed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info_span, Instrument};
use unicast_core::{Address, TransportMessage};

use crate::context::ProcessingContext;
use crate::error::BusError;
use crate::traits::MessageSender;

// ---------------------------------------------------------------------------
// Transport contracts
// ---------------------------------------------------------------------------

/// Typed listener for transport events.
///
/// All listeners run for every event. An error from `processing_started` or
/// `message_received` sends the message down the failed-processing path.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    async fn processing_started(&self, ctx: &ProcessingContext) -> Result<(), BusError>;

    async fn message_received(&self, ctx: &ProcessingContext) -> Result<(), BusError>;

    async fn processing_finished(&self, ctx: &ProcessingContext);

    async fn processing_failed(&self, ctx: &ProcessingContext);
}

/// Handle returned by [`Transport::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Receive-side transport the bus starts, stops, and listens to.
#[async_trait]
pub trait Transport: Send + Sync {
    fn add_listener(&self, listener: Arc<dyn TransportEvents>) -> ListenerId;

    /// Returns `false` if `id` was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Starts receiving on `address`.
    async fn start(&self, address: &Address) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

/// Loopback transport that delivers envelopes handed to [`InMemoryTransport::deliver`].
///
/// Each delivered envelope is round-tripped through its wire encoding first.
/// Raw sends through its [`MessageSender`] implementation are recorded, not
/// delivered.
#[derive(Default)]
pub struct InMemoryTransport {
    listeners: DashMap<ListenerId, Arc<dyn TransportEvents>>,
    next_listener: AtomicU64,
    running: AtomicBool,
    address: RwLock<Option<Address>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    sent: Mutex<Vec<(TransportMessage, Address)>>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one inbound envelope through every registered listener.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] if the transport is not running or the
    /// envelope does not survive encoding. Otherwise returns the first
    /// listener error, after the failed-processing events have been raised.
    pub async fn deliver(&self, message: TransportMessage) -> Result<(), BusError> {
        if !self.is_running() {
            return Err(BusError::Transport(anyhow::anyhow!(
                "transport is not started"
            )));
        }

        let bytes = message.encode().map_err(BusError::Transport)?;
        let received = TransportMessage::decode(&bytes).map_err(BusError::Transport)?;
        let ctx = ProcessingContext::new(received);

        let span = info_span!(
            "inbound_message",
            message_id = %ctx.message_id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let listeners = self.listeners_in_order();
            let result = Self::process(&listeners, &ctx).await;

            if result.is_ok() {
                for listener in &listeners {
                    listener.processing_finished(&ctx).await;
                }
            } else {
                for listener in &listeners {
                    listener.processing_failed(&ctx).await;
                }
            }

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            tracing::debug!(duration_ms, outcome, "inbound message processed");

            result
        }
        .instrument(span)
        .await
    }

    async fn process(
        listeners: &[Arc<dyn TransportEvents>],
        ctx: &ProcessingContext,
    ) -> Result<(), BusError> {
        for listener in listeners {
            listener.processing_started(ctx).await?;
        }
        for listener in listeners {
            listener.message_received(ctx).await?;
        }
        Ok(())
    }

    fn listeners_in_order(&self) -> Vec<Arc<dyn TransportEvents>> {
        let mut entries: Vec<_> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, listener)| listener).collect()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address passed to the most recent `start`.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        self.address.read().clone()
    }

    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Envelopes handed to the raw sender, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<(TransportMessage, Address)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn add_listener(&self, listener: Arc<dyn TransportEvents>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    async fn start(&self, address: &Address) -> anyhow::Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        *self.address.write() = Some(address.clone());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MessageSender for InMemoryTransport {
    async fn send(&self, message: TransportMessage, destination: &Address) -> anyhow::Result<()> {
        self.sent.lock().push((message, destination.clone()));
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("listeners", &self.listeners.len())
            .field("running", &self.is_running())
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
