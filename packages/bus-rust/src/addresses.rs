//! Endpoint address holder with a one-way start-of-day freeze.

use parking_lot::RwLock;
use unicast_core::Address;

use crate::config::BusConfig;
use crate::error::BusError;

#[derive(Debug, Default)]
struct Slots {
    local: Option<Address>,
    input: Option<Address>,
    master: Option<Address>,
    frozen: bool,
}

/// The addresses an endpoint owns: its local queue, the queue its transport
/// listens on, and the master node it may report to.
///
/// Writable until [`EndpointAddresses::freeze`] is called when the bus
/// starts; afterwards every setter fails with [`BusError::AddressFrozen`].
#[derive(Debug, Default)]
pub struct EndpointAddresses {
    slots: RwLock<Slots>,
}

impl EndpointAddresses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the holder from configuration.
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            slots: RwLock::new(Slots {
                local: config.local_address.clone(),
                input: config.input_address.clone(),
                master: config.master_node_address.clone(),
                frozen: false,
            }),
        }
    }

    /// # Errors
    ///
    /// Returns [`BusError::AddressFrozen`] once the bus has started.
    pub fn set_local(&self, address: Address) -> Result<(), BusError> {
        self.update(|slots| slots.local = Some(address))
    }

    /// # Errors
    ///
    /// Returns [`BusError::AddressFrozen`] once the bus has started.
    pub fn set_input(&self, address: Address) -> Result<(), BusError> {
        self.update(|slots| slots.input = Some(address))
    }

    /// # Errors
    ///
    /// Returns [`BusError::AddressFrozen`] once the bus has started.
    pub fn set_master(&self, address: Address) -> Result<(), BusError> {
        self.update(|slots| slots.master = Some(address))
    }

    fn update(&self, apply: impl FnOnce(&mut Slots)) -> Result<(), BusError> {
        let mut slots = self.slots.write();
        if slots.frozen {
            return Err(BusError::AddressFrozen);
        }
        apply(&mut slots);
        Ok(())
    }

    /// Prevents any further changes. Idempotent.
    pub fn freeze(&self) {
        self.slots.write().frozen = true;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.slots.read().frozen
    }

    #[must_use]
    pub fn local(&self) -> Option<Address> {
        self.slots.read().local.clone()
    }

    /// The transport's listening address, falling back to the local address.
    #[must_use]
    pub fn input(&self) -> Option<Address> {
        let slots = self.slots.read();
        slots.input.clone().or_else(|| slots.local.clone())
    }

    #[must_use]
    pub fn master(&self) -> Option<Address> {
        self.slots.read().master.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_defaults_to_local() {
        let addresses = EndpointAddresses::new();
        assert!(addresses.input().is_none());

        addresses.set_local(Address::new("sales", "m1")).unwrap();
        assert_eq!(addresses.input(), Some(Address::new("sales", "m1")));

        addresses.set_input(Address::new("sales.input", "m1")).unwrap();
        assert_eq!(addresses.input(), Some(Address::new("sales.input", "m1")));
    }

    #[test]
    fn setters_fail_after_freeze() {
        let addresses = EndpointAddresses::new();
        addresses.set_local(Address::new("sales", "m1")).unwrap();
        addresses.freeze();

        assert!(addresses.is_frozen());
        assert!(matches!(
            addresses.set_local(Address::new("other", "m1")),
            Err(BusError::AddressFrozen)
        ));
        assert!(matches!(
            addresses.set_master(Address::new("master", "m0")),
            Err(BusError::AddressFrozen)
        ));
        assert_eq!(addresses.local(), Some(Address::new("sales", "m1")));
    }

    #[test]
    fn from_config_copies_addresses() {
        let config = BusConfig {
            local_address: Some(Address::new("sales", "m1")),
            master_node_address: Some(Address::new("distributor", "m0")),
            ..BusConfig::default()
        };
        let addresses = EndpointAddresses::from_config(&config);
        assert_eq!(addresses.local(), config.local_address);
        assert_eq!(addresses.master(), config.master_node_address);
        assert!(!addresses.is_frozen());
    }
}
