//! Message types and logical (pre-serialization) messages.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Messaging role of a message type.
///
/// Commands are sent point-to-point to their owning endpoint; events are
/// published to subscribers. Plain messages may be used either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    Event,
    Message,
}

/// Declared type of a message: its name, role, and whether it is an
/// abstract (interface) type that concrete types may map onto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType {
    name: String,
    kind: MessageKind,
    is_interface: bool,
}

impl MessageType {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_interface: false,
        }
    }

    #[must_use]
    pub fn command(name: impl Into<String>) -> Self {
        Self::new(name, MessageKind::Command)
    }

    #[must_use]
    pub fn event(name: impl Into<String>) -> Self {
        Self::new(name, MessageKind::Event)
    }

    #[must_use]
    pub fn message(name: impl Into<String>) -> Self {
        Self::new(name, MessageKind::Message)
    }

    /// Marks this type as an interface. Interfaces are never followed through
    /// type mappings when resolving routes.
    #[must_use]
    pub fn as_interface(mut self) -> Self {
        self.is_interface = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.is_interface
    }

    /// Commands can neither be published nor subscribed to.
    #[must_use]
    pub fn is_valid_for_pub_sub(&self) -> bool {
        self.kind != MessageKind::Command
    }
}

// ---------------------------------------------------------------------------
// BusMessage trait
// ---------------------------------------------------------------------------

/// Application message that can travel over the bus.
///
/// Implementors declare their [`MessageType`]; the body is carried as JSON
/// inside a [`LogicalMessage`] until the send pipeline serializes it.
pub trait BusMessage: Serialize + Send + Sync + 'static {
    fn message_type() -> MessageType;
}

// ---------------------------------------------------------------------------
// LogicalMessage
// ---------------------------------------------------------------------------

/// An application-level message instance plus its declared type and headers.
///
/// Created per send/publish/reply/raise call and owned by that call until
/// handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    pub message_type: MessageType,
    pub body: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl LogicalMessage {
    #[must_use]
    pub fn new(message_type: MessageType, body: serde_json::Value) -> Self {
        Self {
            message_type,
            body,
            headers: BTreeMap::new(),
        }
    }

    /// Wraps a typed message instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `message` cannot be represented as JSON.
    pub fn from_message<T: BusMessage>(message: &T) -> serde_json::Result<Self> {
        Ok(Self::new(T::message_type(), serde_json::to_value(message)?))
    }

    /// Wraps every instance in `messages`, preserving order.
    ///
    /// # Errors
    ///
    /// Returns the first serialization error encountered.
    pub fn create_multiple<T: BusMessage>(messages: &[T]) -> serde_json::Result<Vec<Self>> {
        messages.iter().map(Self::from_message).collect()
    }

    /// Decodes the body back into a typed instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match `T`'s shape.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.body)
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Returns `true` if this message was declared with type `T`.
    #[must_use]
    pub fn is<T: BusMessage>(&self) -> bool {
        self.message_type == T::message_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct PlaceOrder {
        order_id: u32,
    }

    impl BusMessage for PlaceOrder {
        fn message_type() -> MessageType {
            MessageType::command("PlaceOrder")
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct OrderPlaced;

    impl BusMessage for OrderPlaced {
        fn message_type() -> MessageType {
            MessageType::event("OrderPlaced")
        }
    }

    #[test]
    fn commands_are_not_valid_for_pub_sub() {
        assert!(!PlaceOrder::message_type().is_valid_for_pub_sub());
        assert!(OrderPlaced::message_type().is_valid_for_pub_sub());
        assert!(MessageType::message("Ping").is_valid_for_pub_sub());
    }

    #[test]
    fn interface_flag() {
        let concrete = MessageType::event("OrderPlacedV2");
        assert!(!concrete.is_interface());
        assert!(concrete.as_interface().is_interface());
    }

    #[test]
    fn from_message_carries_type_and_body() {
        let logical = LogicalMessage::from_message(&PlaceOrder { order_id: 7 }).unwrap();
        assert_eq!(logical.message_type.name(), "PlaceOrder");
        assert_eq!(logical.body, serde_json::json!({ "order_id": 7 }));
        assert!(logical.is::<PlaceOrder>());
        assert!(!logical.is::<OrderPlaced>());

        let decoded: PlaceOrder = logical.decode().unwrap();
        assert_eq!(decoded, PlaceOrder { order_id: 7 });
    }

    #[test]
    fn create_multiple_preserves_order() {
        let batch = [PlaceOrder { order_id: 1 }, PlaceOrder { order_id: 2 }];
        let logical = LogicalMessage::create_multiple(&batch).unwrap();
        assert_eq!(logical.len(), 2);
        assert_eq!(logical[1].body["order_id"], 2);
    }

    #[test]
    fn headers_are_attached() {
        let logical = LogicalMessage::from_message(&OrderPlaced)
            .unwrap()
            .with_header("Source", "sales");
        assert_eq!(logical.header("Source"), Some("sales"));
        assert_eq!(logical.header("Missing"), None);
    }
}
