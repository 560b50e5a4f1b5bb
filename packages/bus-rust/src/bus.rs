//! The bus facade: wiring, start, and shutdown.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::addresses::EndpointAddresses;
use crate::callbacks::CallbackRegistry;
use crate::config::BusConfig;
use crate::context::{ChainControl, ProcessingContext};
use crate::dispatch::Dispatcher;
use crate::error::BusError;
use crate::lifecycle::{HookProvider, LifecycleHook, MessageLifecycle};
use crate::observer::{BusObserver, CompositeObserver};
use crate::participants::{
    ParticipantCoordinator, ParticipantProvider, ShutdownReport, StartupParticipant,
};
use crate::predicates::SubscriptionPredicates;
use crate::router::AddressRouter;
use crate::state::{BusState, RunState};
use crate::traits::{MessageSender, PipelineInvoker, SubscriptionManager};
use crate::transport::{ListenerId, Transport, TransportEvents};

// ---------------------------------------------------------------------------
// InboundListener
// ---------------------------------------------------------------------------

/// Transport listener that drives the lifecycle hooks and the inbound
/// pipeline for every received message.
struct InboundListener {
    lifecycle: MessageLifecycle,
    pipeline: Arc<dyn PipelineInvoker>,
    observers: Arc<CompositeObserver>,
}

#[async_trait]
impl TransportEvents for InboundListener {
    async fn processing_started(&self, ctx: &ProcessingContext) -> Result<(), BusError> {
        self.lifecycle.begin(ctx).await
    }

    async fn message_received(&self, ctx: &ProcessingContext) -> Result<(), BusError> {
        if let Some(message) = ctx.current_message() {
            self.observers.on_message_received(&message);
        }
        let control = self
            .pipeline
            .invoke_physical(ctx)
            .await
            .map_err(BusError::Pipeline)?;
        if control == ChainControl::Abort {
            debug!(message_id = %ctx.message_id(), "handler chain aborted");
        }
        Ok(())
    }

    async fn processing_finished(&self, ctx: &ProcessingContext) {
        self.lifecycle.end(ctx).await;
    }

    async fn processing_failed(&self, ctx: &ProcessingContext) {
        self.lifecycle.fail(ctx).await;
    }
}

// ---------------------------------------------------------------------------
// BusBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Bus`] from its configuration and collaborators.
pub struct BusBuilder {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    pipeline: Arc<dyn PipelineInvoker>,
    sender: Arc<dyn MessageSender>,
    subscriptions: Option<Arc<dyn SubscriptionManager>>,
    hooks: Arc<dyn HookProvider>,
    participants: Arc<dyn ParticipantProvider>,
    predicates: Arc<SubscriptionPredicates>,
    observers: Vec<Arc<dyn BusObserver>>,
}

impl BusBuilder {
    #[must_use]
    pub fn new(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        pipeline: Arc<dyn PipelineInvoker>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            config,
            transport,
            pipeline,
            sender,
            subscriptions: None,
            hooks: Arc::new(Vec::<Arc<dyn LifecycleHook>>::new),
            participants: Arc::new(Vec::<Arc<dyn StartupParticipant>>::new),
            predicates: Arc::new(SubscriptionPredicates::new()),
            observers: Vec::new(),
        }
    }

    #[must_use]
    pub fn subscription_manager(mut self, manager: Arc<dyn SubscriptionManager>) -> Self {
        self.subscriptions = Some(manager);
        self
    }

    /// Provider called once per inbound message to build its hook set.
    #[must_use]
    pub fn hooks(mut self, provider: Arc<dyn HookProvider>) -> Self {
        self.hooks = provider;
        self
    }

    /// Provider called once per start to build the participant set.
    #[must_use]
    pub fn participants(mut self, provider: Arc<dyn ParticipantProvider>) -> Self {
        self.participants = provider;
        self
    }

    /// Shares the subscription filter evaluator with the inbound pipeline.
    #[must_use]
    pub fn predicates(mut self, predicates: Arc<SubscriptionPredicates>) -> Self {
        self.predicates = predicates;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn BusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Builds the bus and registers its listener with the transport.
    #[must_use]
    pub fn build(self) -> Bus {
        let observers = Arc::new(CompositeObserver::new(self.observers));
        let dispatcher = Arc::new(Dispatcher {
            addresses: Arc::new(EndpointAddresses::from_config(&self.config)),
            router: Arc::new(AddressRouter::from_mappings(
                &self.config.message_endpoint_mappings,
            )),
            callbacks: Arc::new(CallbackRegistry::new()),
            pipeline: Arc::clone(&self.pipeline),
            sender: self.sender,
            subscriptions: self.subscriptions,
            predicates: self.predicates,
            observers: Arc::clone(&observers),
            state: Arc::new(RunState::new()),
            send_only: self.config.send_only,
            runs_as_worker: self.config.runs_as_worker,
            outgoing_headers: DashMap::new(),
        });

        let listener = Arc::new(InboundListener {
            lifecycle: MessageLifecycle::new(
                self.hooks,
                self.config.endpoint_name.clone(),
                self.config.machine_name.clone(),
            ),
            pipeline: self.pipeline,
            observers,
        });

        let participants =
            ParticipantCoordinator::new(self.participants, self.config.shutdown_timeout());

        let bus = Bus {
            config: self.config,
            transport: self.transport,
            dispatcher,
            participants,
            listener,
            listener_id: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        };
        bus.ensure_listener();
        bus
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// A message bus endpoint.
///
/// State machine: `NotStarted` -> Starting -> Started -> `NotStarted`.
/// Outbound operations live on [`Bus::dispatcher`] and are available from
/// the moment the bus enters `Starting`.
pub struct Bus {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    participants: ParticipantCoordinator,
    listener: Arc<InboundListener>,
    listener_id: Mutex<Option<ListenerId>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl Bus {
    /// Starts the bus. See [`Bus::start_with`].
    ///
    /// # Errors
    ///
    /// See [`Bus::start_with`].
    pub async fn start(&self) -> Result<(), BusError> {
        self.start_with(|_| async { Ok::<(), anyhow::Error>(()) }).await
    }

    /// Starts the bus, running `action` before the transport starts.
    ///
    /// Concurrent calls start the bus at most once; calls on a started bus
    /// return immediately. Under the start lock: enter `Starting`, freeze
    /// the endpoint addresses, run `action`, start the transport on the
    /// input address unless `start_transport` is off, and launch the
    /// participants in the background. Observers are told the bus started
    /// after the lock is released.
    ///
    /// # Errors
    ///
    /// - [`BusError::StartupAction`] if `action` fails.
    /// - [`BusError::NoLocalAddress`] if the transport must start but no
    ///   input or local address is configured.
    /// - [`BusError::Transport`] if the transport fails to start.
    ///
    /// On error the bus returns to `NotStarted`; addresses stay frozen.
    pub async fn start_with<F, Fut>(&self, action: F) -> Result<(), BusError>
    where
        F: FnOnce(Arc<Dispatcher>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.state() == BusState::Started {
            return Ok(());
        }

        {
            let _guard = self.start_lock.lock().await;
            if self.state() == BusState::Started {
                return Ok(());
            }

            self.run_state().set(BusState::Starting);
            self.dispatcher.addresses.freeze();
            self.ensure_listener();

            if let Err(e) = self.start_locked(action).await {
                self.run_state().set(BusState::NotStarted);
                return Err(e);
            }
            self.run_state().set(BusState::Started);

            // Launched under the lock so a racing shutdown always sees them.
            let launched = self.participants.start();
            debug!(participants = launched, "participants launched");
        }

        info!(
            endpoint = %self.config.endpoint_name,
            input = ?self.dispatcher.addresses.input().map(|a| a.to_string()),
            "bus started"
        );
        self.dispatcher.observers.on_bus_started();
        Ok(())
    }

    async fn start_locked<F, Fut>(&self, action: F) -> Result<(), BusError>
    where
        F: FnOnce(Arc<Dispatcher>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        action(Arc::clone(&self.dispatcher))
            .await
            .map_err(BusError::StartupAction)?;

        if !self.config.start_transport {
            debug!("transport start disabled by configuration");
            return Ok(());
        }

        let input = self
            .dispatcher
            .addresses
            .input()
            .ok_or(BusError::NoLocalAddress)?;
        self.transport
            .start(&input)
            .await
            .map_err(BusError::Transport)
    }

    /// Stops the bus: participants first (bounded by the shutdown timeout),
    /// then the transport. Returns what the participant shutdown observed.
    /// Does nothing unless the bus is started.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _guard = self.start_lock.lock().await;
        if self.state() != BusState::Started {
            return ShutdownReport::default();
        }

        info!(endpoint = %self.config.endpoint_name, "shutting down bus");
        let report = self.participants.stop().await;

        if self.config.start_transport {
            if let Err(e) = self.transport.stop().await {
                error!(error = %e, "transport failed to stop");
            }
        }

        let listener_id = self.listener_id.lock().take();
        if let Some(id) = listener_id {
            self.transport.remove_listener(id);
        }

        self.run_state().set(BusState::NotStarted);
        info!(endpoint = %self.config.endpoint_name, "bus stopped");
        report
    }

    fn ensure_listener(&self) {
        let mut listener_id = self.listener_id.lock();
        if listener_id.is_none() {
            let listener: Arc<dyn TransportEvents> = self.listener.clone();
            *listener_id = Some(self.transport.add_listener(listener));
        }
    }

    fn run_state(&self) -> &RunState {
        &self.dispatcher.state
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        self.run_state().get()
    }

    /// Outbound operations.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn addresses(&self) -> &EndpointAddresses {
        &self.dispatcher.addresses
    }

    #[must_use]
    pub fn router(&self) -> &AddressRouter {
        &self.dispatcher.router
    }

    /// Pending completions, resolved by the reply-correlation mechanism.
    #[must_use]
    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.dispatcher.callbacks
    }

    pub fn add_observer(&self, observer: Arc<dyn BusObserver>) {
        self.dispatcher.observers.add(observer);
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("endpoint", &self.config.endpoint_name)
            .field("state", &self.state())
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use unicast_core::{headers, Address, TransportMessage};

    use super::*;
    use crate::test_support::{
        hooks_provider, participants_provider, HookLog, OrderPlaced, PlaceOrder,
        RecordingObserver, RecordingParticipant, RecordingPipeline, StopBehavior,
    };
    use crate::transport::InMemoryTransport;

    struct Fixture {
        bus: Arc<Bus>,
        transport: Arc<InMemoryTransport>,
        pipeline: Arc<RecordingPipeline>,
        observer: Arc<RecordingObserver>,
    }

    fn config() -> BusConfig {
        BusConfig {
            endpoint_name: "sales".to_string(),
            machine_name: "m1".to_string(),
            local_address: Some(Address::new("sales", "m1")),
            ..BusConfig::default()
        }
    }

    fn fixture_with(
        config: BusConfig,
        configure: impl FnOnce(BusBuilder) -> BusBuilder,
    ) -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        let pipeline = Arc::new(RecordingPipeline::default());
        let observer = Arc::new(RecordingObserver::default());
        let builder = BusBuilder::new(config, transport.clone(), pipeline.clone(), transport.clone())
            .observer(observer.clone());
        let bus = Arc::new(configure(builder).build());
        bus.router().add_route("PlaceOrder", Address::new("orders", "m2"));
        Fixture {
            bus,
            transport,
            pipeline,
            observer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config(), |b| b)
    }

    // -- start --------------------------------------------------------------

    #[tokio::test]
    async fn start_starts_transport_on_input_address() {
        let f = fixture_with(
            BusConfig {
                input_address: Some(Address::new("sales.input", "m1")),
                ..config()
            },
            |b| b,
        );
        assert_eq!(f.bus.state(), BusState::NotStarted);
        f.bus.start().await.unwrap();

        assert_eq!(f.bus.state(), BusState::Started);
        assert_eq!(f.transport.address(), Some(Address::new("sales.input", "m1")));
        assert_eq!(f.observer.bus_started(), 1);
        assert!(f.bus.addresses().is_frozen());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_start_once() {
        let f = fixture();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let bus = Arc::clone(&f.bus);
                tokio::spawn(async move { bus.start().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(f.transport.start_calls(), 1);
        assert_eq!(f.observer.bus_started(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let f = fixture();
        f.bus.start().await.unwrap();
        f.bus.start().await.unwrap();
        assert_eq!(f.transport.start_calls(), 1);
        assert_eq!(f.observer.bus_started(), 1);
    }

    #[tokio::test]
    async fn transport_start_can_be_disabled() {
        let f = fixture_with(
            BusConfig {
                start_transport: false,
                ..config()
            },
            |b| b,
        );
        f.bus.start().await.unwrap();
        assert_eq!(f.bus.state(), BusState::Started);
        assert_eq!(f.transport.start_calls(), 0);

        f.bus.shutdown().await;
        assert_eq!(f.transport.stop_calls(), 0);
    }

    #[tokio::test]
    async fn start_without_any_address_fails() {
        let f = fixture_with(
            BusConfig {
                local_address: None,
                ..config()
            },
            |b| b,
        );
        let err = f.bus.start().await.unwrap_err();
        assert!(matches!(err, BusError::NoLocalAddress));
        assert_eq!(f.bus.state(), BusState::NotStarted);
        assert_eq!(f.observer.bus_started(), 0);
    }

    #[tokio::test]
    async fn startup_action_can_send() {
        let f = fixture();
        f.bus
            .start_with(|dispatcher| async move {
                dispatcher.send(&PlaceOrder { order_id: 1 }).await?;
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap();

        assert_eq!(f.pipeline.sends().len(), 1);
        assert_eq!(f.bus.state(), BusState::Started);
    }

    #[tokio::test]
    async fn failing_startup_action_leaves_bus_stopped() {
        let f = fixture();
        let err = f
            .bus
            .start_with(|_| async { Err::<(), _>(anyhow::anyhow!("migration failed")) })
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::StartupAction(_)));
        assert_eq!(f.bus.state(), BusState::NotStarted);
        assert_eq!(f.transport.start_calls(), 0);
        assert!(f.bus.addresses().is_frozen());
    }

    #[tokio::test]
    async fn dispatch_before_start_fails() {
        let f = fixture();
        let err = f
            .bus
            .dispatcher()
            .send(&PlaceOrder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotStarted));
    }

    #[tokio::test]
    async fn start_launches_participants() {
        let log = HookLog::default();
        let f = fixture_with(config(), |b| {
            b.participants(participants_provider(vec![RecordingParticipant::new("timeouts", &log)]))
        });
        f.bus.start().await.unwrap();
        let report = f.bus.shutdown().await;

        assert_eq!(report.stopped, vec!["timeouts"]);
        assert_eq!(log.entries(), vec!["start timeouts", "stop timeouts"]);
    }

    // -- inbound ------------------------------------------------------------

    #[tokio::test]
    async fn inbound_message_runs_hooks_around_pipeline() {
        let log = HookLog::default();
        let f = fixture_with(config(), |b| b.hooks(hooks_provider(&log, &["A", "B"], None)));
        f.bus.start().await.unwrap();

        f.transport.deliver(TransportMessage::with_id("in-1")).await.unwrap();

        assert_eq!(log.entries(), vec!["begin A", "begin B", "end B", "end A"]);
        let processed = f.pipeline.processed();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].id, "in-1");
        assert_eq!(processed[0].header(headers::PROCESSING_ENDPOINT), Some("sales"));
        assert_eq!(processed[0].header(headers::PROCESSING_MACHINE), Some("m1"));
        assert_eq!(f.observer.received(), vec!["in-1".to_string()]);
    }

    #[tokio::test]
    async fn pipeline_failure_runs_error_hooks() {
        let log = HookLog::default();
        let f = fixture_with(config(), |b| b.hooks(hooks_provider(&log, &["A", "B", "C"], None)));
        f.bus.start().await.unwrap();
        f.pipeline.fail_physical(true);

        let err = f.transport.deliver(TransportMessage::new()).await.unwrap_err();
        assert!(matches!(err, BusError::Pipeline(_)));
        assert_eq!(
            log.entries(),
            vec!["begin A", "begin B", "begin C", "error C", "error B", "error A"]
        );
    }

    #[tokio::test]
    async fn begin_hook_failure_skips_pipeline() {
        let log = HookLog::default();
        let f = fixture_with(config(), |b| {
            b.hooks(hooks_provider(&log, &["A", "B", "C"], Some("A")))
        });
        f.bus.start().await.unwrap();

        let err = f.transport.deliver(TransportMessage::new()).await.unwrap_err();
        assert!(matches!(err, BusError::HookFailure { .. }));
        assert!(f.pipeline.processed().is_empty());
        assert_eq!(log.entries(), vec!["begin A", "error C", "error B", "error A"]);
    }

    #[tokio::test]
    async fn concurrent_messages_keep_separate_contexts() {
        let f = fixture();
        f.bus.start().await.unwrap();

        let deliveries: Vec<_> = (0..16)
            .map(|i| {
                let transport = Arc::clone(&f.transport);
                tokio::spawn(async move {
                    transport
                        .deliver(TransportMessage::with_id(format!("in-{i}")))
                        .await
                })
            })
            .collect();
        for delivery in deliveries {
            delivery.await.unwrap().unwrap();
        }

        let mut ids: Vec<String> = f.pipeline.processed().into_iter().map(|m| m.id).collect();
        ids.sort();
        let mut expected: Vec<String> = (0..16).map(|i| format!("in-{i}")).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    // -- shutdown -----------------------------------------------------------

    #[tokio::test]
    async fn shutdown_stops_transport_and_detaches_listener() {
        let f = fixture();
        f.bus.start().await.unwrap();
        assert_eq!(f.transport.listener_count(), 1);

        let report = f.bus.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(f.bus.state(), BusState::NotStarted);
        assert_eq!(f.transport.stop_calls(), 1);
        assert_eq!(f.transport.listener_count(), 0);

        let err = f.bus.dispatcher().publish(&OrderPlaced::default()).await.unwrap_err();
        assert!(matches!(err, BusError::NotStarted));
    }

    /// Begins a shutdown from inside the started notification, racing the
    /// tail of `start_with`.
    #[derive(Default)]
    struct ShutdownOnStart {
        bus: Mutex<Option<Arc<Bus>>>,
        task: Mutex<Option<tokio::task::JoinHandle<ShutdownReport>>>,
    }

    impl BusObserver for ShutdownOnStart {
        fn on_bus_started(&self) {
            if let Some(bus) = self.bus.lock().take() {
                *self.task.lock() = Some(tokio::spawn(async move { bus.shutdown().await }));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_racing_start_stops_launched_participants() {
        let log = HookLog::default();
        let f = fixture_with(config(), |b| {
            b.participants(participants_provider(vec![RecordingParticipant::new("timeouts", &log)]))
        });
        let racer = Arc::new(ShutdownOnStart::default());
        *racer.bus.lock() = Some(Arc::clone(&f.bus));
        f.bus.add_observer(racer.clone());

        f.bus.start().await.unwrap();
        let task = racer.task.lock().take().unwrap();
        let report = task.await.unwrap();

        assert_eq!(report.stopped, vec!["timeouts"]);
        assert_eq!(f.bus.state(), BusState::NotStarted);
        assert!(!f.bus.participants.is_running());
        assert_eq!(log.entries(), vec!["start timeouts", "stop timeouts"]);

        // The next start resolves a fresh participant set.
        f.bus.start().await.unwrap();
        assert!(f.bus.participants.is_running());
        f.bus.shutdown().await;
        assert_eq!(
            log.entries(),
            vec!["start timeouts", "stop timeouts", "start timeouts", "stop timeouts"]
        );
    }

    #[tokio::test]
    async fn shutdown_before_start_does_nothing() {
        let f = fixture();
        assert_eq!(f.bus.shutdown().await, ShutdownReport::default());
        assert_eq!(f.transport.stop_calls(), 0);
    }

    #[tokio::test]
    async fn bus_can_restart_after_shutdown() {
        let f = fixture();
        f.bus.start().await.unwrap();
        f.bus.shutdown().await;
        f.bus.start().await.unwrap();

        assert_eq!(f.transport.start_calls(), 2);
        assert_eq!(f.transport.listener_count(), 1);
        assert_eq!(f.observer.bus_started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_with_stuck_participant_returns_within_timeout() {
        let log = HookLog::default();
        let f = fixture_with(
            BusConfig {
                shutdown_timeout_ms: 20_000,
                ..config()
            },
            |b| {
                b.participants(participants_provider(vec![
                    RecordingParticipant::new("stuck", &log).with_stop(StopBehavior::Hang),
                ]))
            },
        );
        f.bus.start().await.unwrap();

        let began = tokio::time::Instant::now();
        let report = f.bus.shutdown().await;

        assert!(began.elapsed() <= Duration::from_secs(20));
        assert_eq!(report.timed_out, vec!["stuck"]);
        assert_eq!(f.bus.state(), BusState::NotStarted);
        assert_eq!(f.transport.stop_calls(), 1);
    }
}
