//! Recording test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use unicast_core::{
    Address, BusMessage, LogicalMessage, MessageType, SendOptions, TransportMessage,
};

use crate::context::{ChainControl, ProcessingContext};
use crate::lifecycle::{HookProvider, LifecycleHook};
use crate::observer::BusObserver;
use crate::participants::{ParticipantProvider, StartupParticipant};
use crate::traits::{MessageSender, PipelineInvoker, SendOutcome, SubscriptionManager};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: u32,
}

impl BusMessage for PlaceOrder {
    fn message_type() -> MessageType {
        MessageType::command("PlaceOrder")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u32,
}

impl BusMessage for OrderPlaced {
    fn message_type() -> MessageType {
        MessageType::event("OrderPlaced")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceChanged {
    pub amount: u32,
}

impl BusMessage for PriceChanged {
    fn message_type() -> MessageType {
        MessageType::event("PriceChanged")
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Records every invocation. Sends succeed with a fresh envelope unless told
/// to fail.
#[derive(Default)]
pub struct RecordingPipeline {
    sends: Mutex<Vec<(SendOptions, Vec<LogicalMessage>)>>,
    control_sends: Mutex<Vec<(SendOptions, TransportMessage)>>,
    processed: Mutex<Vec<TransportMessage>>,
    raised: Mutex<Vec<LogicalMessage>>,
    no_subscribers: AtomicBool,
    fail_sends: AtomicBool,
    fail_physical: AtomicBool,
}

impl RecordingPipeline {
    pub fn sends(&self) -> Vec<(SendOptions, Vec<LogicalMessage>)> {
        self.sends.lock().clone()
    }

    pub fn control_sends(&self) -> Vec<(SendOptions, TransportMessage)> {
        self.control_sends.lock().clone()
    }

    /// Inbound messages as seen by the physical pipeline.
    pub fn processed(&self) -> Vec<TransportMessage> {
        self.processed.lock().clone()
    }

    pub fn raised(&self) -> Vec<LogicalMessage> {
        self.raised.lock().clone()
    }

    pub fn set_subscribers_found(&self, found: bool) {
        self.no_subscribers.store(!found, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_physical(&self, fail: bool) {
        self.fail_physical.store(fail, Ordering::SeqCst);
    }

    fn outcome(&self, options: &SendOptions) -> SendOutcome {
        let mut physical = TransportMessage::new();
        physical.intent = options.intent();
        physical.correlation_id = options.correlation_id().map(str::to_string);
        physical.reply_to_address = options.reply_to().cloned();
        SendOutcome {
            physical,
            subscribers_found: !self.no_subscribers.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl PipelineInvoker for RecordingPipeline {
    async fn invoke_send(
        &self,
        options: &SendOptions,
        messages: Vec<LogicalMessage>,
    ) -> anyhow::Result<SendOutcome> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("send pipeline failed");
        }
        self.sends.lock().push((options.clone(), messages));
        Ok(self.outcome(options))
    }

    async fn invoke_send_control(
        &self,
        options: &SendOptions,
        message: TransportMessage,
    ) -> anyhow::Result<SendOutcome> {
        self.control_sends.lock().push((options.clone(), message.clone()));
        Ok(SendOutcome {
            physical: message,
            subscribers_found: true,
        })
    }

    async fn invoke_physical(&self, ctx: &ProcessingContext) -> anyhow::Result<ChainControl> {
        if self.fail_physical.load(Ordering::SeqCst) {
            anyhow::bail!("handler failed");
        }
        if let Some(message) = ctx.current_message() {
            self.processed.lock().push(message);
        }
        Ok(ctx.chain_control())
    }

    async fn invoke_logical(&self, message: LogicalMessage) -> anyhow::Result<()> {
        self.raised.lock().push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sender and subscriptions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(TransportMessage, Address)>>,
    fail: AtomicBool,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<(TransportMessage, Address)> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: TransportMessage, destination: &Address) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        self.sent.lock().push((message, destination.clone()));
        Ok(())
    }
}

/// Records `(operation, message type, publisher)` triples.
#[derive(Default)]
pub struct RecordingSubscriptions {
    calls: Mutex<Vec<(String, String, Address)>>,
}

impl RecordingSubscriptions {
    pub fn calls(&self) -> Vec<(String, String, Address)> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: &str, message_type: &MessageType, publisher: &Address) {
        self.calls.lock().push((
            operation.to_string(),
            message_type.name().to_string(),
            publisher.clone(),
        ));
    }
}

#[async_trait]
impl SubscriptionManager for RecordingSubscriptions {
    async fn subscribe(&self, message_type: &MessageType, publisher: &Address) -> anyhow::Result<()> {
        self.record("subscribe", message_type, publisher);
        Ok(())
    }

    async fn unsubscribe(&self, message_type: &MessageType, publisher: &Address) -> anyhow::Result<()> {
        self.record("unsubscribe", message_type, publisher);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingObserver {
    sent: Mutex<Vec<Vec<LogicalMessage>>>,
    no_subscribers: Mutex<Vec<LogicalMessage>>,
    received: Mutex<Vec<String>>,
    bus_started: AtomicUsize,
}

impl RecordingObserver {
    pub fn sent(&self) -> Vec<Vec<LogicalMessage>> {
        self.sent.lock().clone()
    }

    pub fn no_subscribers(&self) -> Vec<LogicalMessage> {
        self.no_subscribers.lock().clone()
    }

    /// Ids of received messages.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn bus_started(&self) -> usize {
        self.bus_started.load(Ordering::SeqCst)
    }
}

impl BusObserver for RecordingObserver {
    fn on_messages_sent(&self, messages: &[LogicalMessage]) {
        self.sent.lock().push(messages.to_vec());
    }

    fn on_no_subscribers(&self, message: &LogicalMessage) {
        self.no_subscribers.lock().push(message.clone());
    }

    fn on_bus_started(&self) {
        self.bus_started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message_received(&self, message: &TransportMessage) {
        self.received.lock().push(message.id.clone());
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Shared, ordered event log.
#[derive(Debug, Clone, Default)]
pub struct HookLog(Arc<Mutex<Vec<String>>>);

impl HookLog {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub struct RecordingHook {
    name: String,
    log: HookLog,
    fail_begin: bool,
}

impl RecordingHook {
    pub fn new(name: &str, log: &HookLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            fail_begin: false,
        }
    }

    pub fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }
}

#[async_trait]
impl LifecycleHook for RecordingHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        self.log.push(format!("begin {}", self.name));
        if self.fail_begin {
            anyhow::bail!("{} refused to begin", self.name);
        }
        Ok(())
    }

    async fn end(&self, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        self.log.push(format!("end {}", self.name));
        Ok(())
    }

    async fn error(&self, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        self.log.push(format!("error {}", self.name));
        Ok(())
    }
}

/// Provider building fresh [`RecordingHook`]s named `names`, in order, on
/// every call. The hook named `failing` fails its begin phase.
pub fn hooks_provider(log: &HookLog, names: &[&str], failing: Option<&str>) -> Arc<dyn HookProvider> {
    let log = log.clone();
    let names: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
    let failing = failing.map(str::to_string);
    Arc::new(move || {
        names
            .iter()
            .map(|name| {
                let hook = RecordingHook::new(name, &log);
                let hook = if failing.as_deref() == Some(name.as_str()) {
                    hook.failing_begin()
                } else {
                    hook
                };
                Arc::new(hook) as Arc<dyn LifecycleHook>
            })
            .collect::<Vec<_>>()
    })
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    Succeed,
    Fail,
    /// Never returns.
    Hang,
}

pub struct RecordingParticipant {
    name: String,
    log: HookLog,
    start_delay: Option<Duration>,
    fail_start: bool,
    stop: StopBehavior,
}

impl RecordingParticipant {
    pub fn new(name: &str, log: &HookLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            start_delay: None,
            fail_start: false,
            stop: StopBehavior::Succeed,
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_stop(mut self, stop: StopBehavior) -> Self {
        self.stop = stop;
        self
    }
}

#[async_trait]
impl StartupParticipant for RecordingParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.log.push(format!("start {}", self.name));
        if self.fail_start {
            anyhow::bail!("{} failed to start", self.name);
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        match self.stop {
            StopBehavior::Succeed => {
                self.log.push(format!("stop {}", self.name));
                Ok(())
            }
            StopBehavior::Fail => anyhow::bail!("{} failed to stop", self.name),
            StopBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Provider returning the same participant instances on every call.
pub fn participants_provider(participants: Vec<RecordingParticipant>) -> Arc<dyn ParticipantProvider> {
    let participants: Vec<Arc<dyn StartupParticipant>> = participants
        .into_iter()
        .map(|p| Arc::new(p) as Arc<dyn StartupParticipant>)
        .collect();
    Arc::new(move || participants.clone())
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// In-memory sink for `tracing` output, installed per thread with
/// [`LogCapture::install`].
#[derive(Debug, Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
