//! Physical (transport) message envelope.
//!
//! The envelope is what the transport moves between endpoints. It encodes
//! to `MsgPack` with named fields via `rmp_serde::to_vec_named()` so the
//! wire form stays self-describing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::headers;

/// Purpose of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageIntent {
    #[default]
    Send,
    Publish,
    Reply,
}

/// The serialized envelope produced by the send pipeline.
///
/// Owned by the transport once handed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    /// Unique identifier; outbound callbacks are keyed by it.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to_address: Option<Address>,
    pub intent: MessageIntent,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes", default)]
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Creates an empty envelope with a fresh v4 UUID identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            correlation_id: None,
            reply_to_address: None,
            intent: MessageIntent::Send,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Creates a body-less control message whose replies go to `reply_to`.
    #[must_use]
    pub fn control(reply_to: Option<Address>) -> Self {
        let mut message = Self::new();
        message.reply_to_address = reply_to;
        message.set_header(headers::CONTROL_MESSAGE, "true");
        message
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.header(headers::CONTROL_MESSAGE) == Some("true")
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// The correlation id a reply to this message should carry: its own
    /// correlation id when set, otherwise its id.
    #[must_use]
    pub fn reply_correlation_id(&self) -> &str {
        match self.correlation_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.id,
        }
    }

    /// Encodes the envelope to `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes an envelope previously produced by [`TransportMessage::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Default for TransportMessage {
    fn default() -> Self {
        Self::new()
    }
}
