//! Unicast Bus — dispatch core, routing, message lifecycle, and startup/shutdown coordination.

pub mod addresses;
pub mod bus;
pub mod callbacks;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod observer;
pub mod participants;
pub mod predicates;
pub mod router;
pub mod state;
pub mod traits;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use addresses::EndpointAddresses;
pub use bus::{Bus, BusBuilder};
pub use callbacks::{CallbackError, CallbackHandle, CallbackRegistry, CompletionResult};
pub use config::{BusConfig, MessageEndpointMapping};
pub use context::{ChainControl, ProcessingContext, ProcessingState};
pub use dispatch::Dispatcher;
pub use error::BusError;
pub use lifecycle::{HookProvider, LifecycleHook, MessageLifecycle};
pub use observer::{BusObserver, CompositeObserver};
pub use participants::{ParticipantProvider, ShutdownReport, StartupParticipant};
pub use predicates::{MessagePredicate, SubscriptionPredicates};
pub use router::AddressRouter;
pub use state::BusState;
pub use traits::{MessageSender, PipelineInvoker, SendOutcome, SubscriptionManager};
pub use transport::{InMemoryTransport, ListenerId, Transport, TransportEvents};
