//! Single-process demo endpoint: sends and publishes through an in-memory
//! pipeline and receives its own messages back over the loopback transport.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unicast_bus::{
    BusBuilder, BusConfig, BusObserver, ChainControl, InMemoryTransport, PipelineInvoker,
    ProcessingContext, SendOutcome, SubscriptionPredicates,
};
use unicast_core::{Address, BusMessage, LogicalMessage, MessageType, SendOptions, TransportMessage};

#[derive(Parser)]
#[command(name = "loopback", about = "Unicast bus loopback demo")]
struct Cli {
    /// Endpoint name; also the local queue name.
    #[arg(long, default_value = "loopback")]
    endpoint: String,

    /// Number of orders to send to ourselves.
    #[arg(long, default_value_t = 3)]
    orders: u32,

    /// Log level (overridden by `RUST_LOG`).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    #[arg(long, env = "UNICAST_SHUTDOWN_TIMEOUT_MS", default_value_t = 20_000)]
    shutdown_timeout_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlaceOrder {
    order_id: u32,
}

impl BusMessage for PlaceOrder {
    fn message_type() -> MessageType {
        MessageType::command("PlaceOrder")
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
}

impl BusMessage for OrderPlaced {
    fn message_type() -> MessageType {
        MessageType::event("OrderPlaced")
    }
}

// ---------------------------------------------------------------------------
// In-memory pipeline
// ---------------------------------------------------------------------------

/// Serializes logical messages as a JSON array into the envelope body and
/// queues the envelope for loopback delivery. Nothing subscribes to
/// anything, so publishes always report no subscribers.
struct LoopbackPipeline {
    outbox: mpsc::UnboundedSender<TransportMessage>,
    predicates: Arc<SubscriptionPredicates>,
}

impl LoopbackPipeline {
    fn envelope(options: &SendOptions, messages: &[LogicalMessage]) -> anyhow::Result<TransportMessage> {
        let mut physical = TransportMessage::new();
        physical.intent = options.intent();
        physical.correlation_id = options.correlation_id().map(str::to_string);
        physical.reply_to_address = options.reply_to().cloned();
        physical.body = serde_json::to_vec(messages)?;
        Ok(physical)
    }
}

#[async_trait]
impl PipelineInvoker for LoopbackPipeline {
    async fn invoke_send(
        &self,
        options: &SendOptions,
        messages: Vec<LogicalMessage>,
    ) -> anyhow::Result<SendOutcome> {
        let physical = Self::envelope(options, &messages)?;
        let subscribers_found = options.destination().is_some();
        if subscribers_found {
            self.outbox
                .send(physical.clone())
                .context("loopback outbox closed")?;
        }
        Ok(SendOutcome {
            physical,
            subscribers_found,
        })
    }

    async fn invoke_send_control(
        &self,
        _options: &SendOptions,
        message: TransportMessage,
    ) -> anyhow::Result<SendOutcome> {
        self.outbox
            .send(message.clone())
            .context("loopback outbox closed")?;
        Ok(SendOutcome {
            physical: message,
            subscribers_found: true,
        })
    }

    async fn invoke_physical(&self, ctx: &ProcessingContext) -> anyhow::Result<ChainControl> {
        let Some(message) = ctx.current_message() else {
            return Ok(ctx.chain_control());
        };
        if message.is_control() {
            info!(message_id = %message.id, "control message received");
            return Ok(ChainControl::Continue);
        }

        let logical: Vec<LogicalMessage> = serde_json::from_slice(&message.body)?;
        for message in logical {
            if ctx.chain_control() == ChainControl::Abort {
                return Ok(ChainControl::Abort);
            }
            if !self.predicates.evaluate(&message) {
                continue;
            }
            info!(
                message_type = message.message_type.name(),
                body = %message.body,
                "handled message"
            );
        }
        Ok(ctx.chain_control())
    }

    async fn invoke_logical(&self, message: LogicalMessage) -> anyhow::Result<()> {
        info!(message_type = message.message_type.name(), "raised message handled in memory");
        Ok(())
    }
}

struct LoggingObserver;

impl BusObserver for LoggingObserver {
    fn on_messages_sent(&self, messages: &[LogicalMessage]) {
        info!(count = messages.len(), "messages sent");
    }

    fn on_no_subscribers(&self, message: &LogicalMessage) {
        warn!(message_type = message.message_type.name(), "no subscribers for message");
    }

    fn on_bus_started(&self) {
        info!("bus started notification");
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = BusConfig {
        endpoint_name: cli.endpoint.clone(),
        local_address: Some(Address::parse(&cli.endpoint)?),
        shutdown_timeout_ms: cli.shutdown_timeout_ms,
        ..BusConfig::default()
    };
    let local = config
        .local_address
        .clone()
        .context("local address is required")?;

    let transport = Arc::new(InMemoryTransport::new());
    let predicates = Arc::new(SubscriptionPredicates::new());
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let pipeline = Arc::new(LoopbackPipeline {
        outbox,
        predicates: Arc::clone(&predicates),
    });

    let bus = BusBuilder::new(config, transport.clone(), pipeline, transport.clone())
        .predicates(predicates)
        .observer(Arc::new(LoggingObserver))
        .build();
    bus.router().add_route(PlaceOrder::message_type().name(), local);

    bus.start().await?;
    let dispatcher = bus.dispatcher();
    dispatcher.set_outgoing_header("Demo.Source", cli.endpoint.as_str());

    for order_id in 1..=cli.orders {
        dispatcher.send(&PlaceOrder { order_id }).await?;
    }
    dispatcher.publish_batch::<OrderPlaced>(&[]).await?;
    dispatcher.raise(&OrderPlaced { order_id: 0 }).await?;

    while let Ok(message) = inbox.try_recv() {
        if let Err(e) = transport.deliver(message).await {
            warn!(error = %e, "delivery failed");
        }
    }

    let report = bus.shutdown().await;
    info!(
        stopped = report.stopped.len(),
        timed_out = report.timed_out.len(),
        pending_callbacks = bus.callbacks().len(),
        "loopback demo finished"
    );
    Ok(())
}
