//! Message-type to destination routing.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;
use unicast_core::{Address, MessageType};

use crate::config::MessageEndpointMapping;

/// Resolves a message's declared type to the address of its owning endpoint.
///
/// Explicit routes are keyed by type name. When a concrete type has no
/// route of its own but has been mapped onto another type (typically the
/// interface it implements), resolution follows the mapping. Interfaces are
/// never followed further.
#[derive(Debug, Default)]
pub struct AddressRouter {
    routes: DashMap<String, Address>,
    mappings: DashMap<String, MessageType>,
}

impl AddressRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a router from the static route table.
    #[must_use]
    pub fn from_mappings(mappings: &[MessageEndpointMapping]) -> Self {
        let router = Self::new();
        for mapping in mappings {
            router.add_route(&mapping.messages, mapping.endpoint.clone());
        }
        router
    }

    /// Routes messages of `type_name` to `destination`, replacing any
    /// previous route.
    pub fn add_route(&self, type_name: &str, destination: Address) {
        self.routes.insert(type_name.to_string(), destination);
    }

    /// Maps a concrete type onto another type for route lookup.
    pub fn map_type(&self, concrete: &MessageType, mapped: MessageType) {
        self.mappings.insert(concrete.name().to_string(), mapped);
    }

    /// Resolves `message_type` to a destination.
    ///
    /// Returns [`Address::undefined`] when neither the type nor anything it
    /// maps onto has a route. Callers decide whether that is an error.
    #[must_use]
    pub fn resolve(&self, message_type: &MessageType) -> Address {
        let mut current = message_type.clone();
        let mut visited = HashSet::new();

        loop {
            if let Some(destination) = self.routes.get(current.name()) {
                return destination.clone();
            }

            // Mapping cycles terminate as "no route".
            if current.is_interface() || !visited.insert(current.name().to_string()) {
                return Address::undefined();
            }

            let next = match self.mappings.get(current.name()) {
                Some(mapped) if mapped.name() != current.name() => mapped.clone(),
                _ => return Address::undefined(),
            };

            debug!(from = current.name(), to = next.name(), "following type mapping");
            current = next;
        }
    }
}
