//! Bus configuration.
//!
//! Configuration is supplied fully formed by whatever loads it; the bus
//! never reads files or the environment itself. `BusConfig` derives
//! `Deserialize` so a loader can build it from JSON/TOML/YAML directly.

use std::time::Duration;

use serde::Deserialize;
use unicast_core::Address;

/// Default bound on how long shutdown waits for participants to stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 20_000;

/// Endpoint-level configuration for a [`Bus`](crate::Bus).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Logical name of this endpoint, stamped on processed messages.
    pub endpoint_name: String,
    /// Machine identity stamped on processed messages. Defaults to the host name.
    pub machine_name: String,
    /// This endpoint's own queue. Required for subscribing and deferring.
    pub local_address: Option<Address>,
    /// Queue the transport listens on. Defaults to `local_address`.
    pub input_address: Option<Address>,
    /// Master (distributor) node; used by workers and for gateway sends.
    pub master_node_address: Option<Address>,
    /// Whether this instance is a worker behind a master node.
    pub runs_as_worker: bool,
    /// A send-only endpoint never receives, so it may not subscribe.
    pub send_only: bool,
    /// Whether `start()` starts the transport. Disabled for hosts that
    /// drive the transport themselves.
    pub start_transport: bool,
    /// Upper bound for participant stops during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Static route table: message type name -> owning endpoint.
    pub message_endpoint_mappings: Vec<MessageEndpointMapping>,
}

impl BusConfig {
    /// Shutdown bound as a `Duration`.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint_name: String::new(),
            machine_name: default_machine_name(),
            local_address: None,
            input_address: None,
            master_node_address: None,
            runs_as_worker: false,
            send_only: false,
            start_transport: true,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            message_endpoint_mappings: Vec::new(),
        }
    }
}

/// One row of the static route table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageEndpointMapping {
    /// Message type name as declared by `BusMessage::message_type()`.
    pub messages: String,
    /// Owning endpoint address (`queue@machine` or `queue`).
    pub endpoint: Address,
}

fn default_machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| unicast_core::address::DEFAULT_MACHINE.to_string())
}
