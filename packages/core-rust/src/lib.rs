//! Unicast Core — addresses, logical and transport messages, and send options.

pub mod address;
pub mod headers;
pub mod message;
pub mod options;
pub mod transport_message;

pub use address::Address;
pub use message::{BusMessage, LogicalMessage, MessageKind, MessageType};
pub use options::{DeliveryDelay, SendOptions};
pub use transport_message::{MessageIntent, TransportMessage};
