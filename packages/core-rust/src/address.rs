//! Endpoint addresses.
//!
//! An [`Address`] names a queue on a machine. Addresses serialize to the
//! string form `"queue@machine"`; the machine part may be omitted when
//! parsing, in which case the caller-supplied default (or `localhost`) is used.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine name used by [`Address::parse`] when the input carries none.
pub const DEFAULT_MACHINE: &str = "localhost";

/// Separator between the queue and machine parts.
const MACHINE_SEPARATOR: char = '@';

/// Separator between a queue and its sub-scope qualifier.
const SCOPE_SEPARATOR: char = '.';

/// Opaque destination identifier: a queue plus the machine that hosts it.
///
/// Values are immutable; deriving a sub-scope produces a new address.
/// The "undefined" sentinel (both parts empty) is what routing returns when
/// no destination is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    queue: String,
    machine: String,
}

impl Address {
    /// Creates an address from explicit queue and machine names.
    #[must_use]
    pub fn new(queue: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            machine: machine.into(),
        }
    }

    /// The sentinel returned when no destination can be resolved.
    #[must_use]
    pub fn undefined() -> Self {
        Self {
            queue: String::new(),
            machine: String::new(),
        }
    }

    /// Returns `true` for the [`Address::undefined`] sentinel.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        self.queue.is_empty() && self.machine.is_empty()
    }

    /// Parses `"queue@machine"` or `"queue"`, defaulting the machine to
    /// [`DEFAULT_MACHINE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the queue part is empty.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        Self::parse_with_default_machine(value, DEFAULT_MACHINE)
    }

    /// Parses `"queue@machine"` or `"queue"`, filling a missing machine with
    /// `default_machine`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue part is empty, or if the machine part
    /// is present but empty (`"queue@"`).
    pub fn parse_with_default_machine(value: &str, default_machine: &str) -> anyhow::Result<Self> {
        let value = value.trim();
        let (queue, machine) = match value.split_once(MACHINE_SEPARATOR) {
            Some((queue, machine)) => {
                if machine.is_empty() {
                    anyhow::bail!("address '{value}' has an empty machine name");
                }
                (queue, machine)
            }
            None => (value, default_machine),
        };

        if queue.is_empty() {
            anyhow::bail!("address '{value}' has an empty queue name");
        }

        Ok(Self::new(queue, machine))
    }

    /// Derives the address of a sub-scope of this queue (`queue.qualifier`)
    /// on the same machine.
    #[must_use]
    pub fn sub_scope(&self, qualifier: &str) -> Self {
        Self {
            queue: format!("{}{SCOPE_SEPARATOR}{qualifier}", self.queue),
            machine: self.machine.clone(),
        }
    }

    /// The queue (endpoint) name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The machine hosting the queue.
    #[must_use]
    pub fn machine(&self) -> &str {
        &self.machine
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            return Ok(());
        }
        write!(f, "{}{MACHINE_SEPARATOR}{}", self.queue, self.machine)
    }
}

impl TryFrom<String> for Address {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Ok(Self::undefined());
        }
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_queue_and_machine() {
        let address = Address::parse("orders@server01").unwrap();
        assert_eq!(address.queue(), "orders");
        assert_eq!(address.machine(), "server01");
        assert_eq!(address.to_string(), "orders@server01");
    }

    #[test]
    fn parse_without_machine_uses_default() {
        let address = Address::parse("orders").unwrap();
        assert_eq!(address.machine(), DEFAULT_MACHINE);

        let address = Address::parse_with_default_machine("orders", "box").unwrap();
        assert_eq!(address.machine(), "box");
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("@server01").is_err());
        assert!(Address::parse("orders@").is_err());
    }

    #[test]
    fn undefined_sentinel() {
        let undefined = Address::undefined();
        assert!(undefined.is_undefined());
        assert!(!Address::new("q", "m").is_undefined());
        assert_eq!(undefined.to_string(), "");
    }

    #[test]
    fn sub_scope_keeps_machine() {
        let master = Address::new("distributor", "master01");
        let gateway = master.sub_scope("gateway");
        assert_eq!(gateway.queue(), "distributor.gateway");
        assert_eq!(gateway.machine(), "master01");
        // Deriving a sub-scope leaves the parent unchanged.
        assert_eq!(master.queue(), "distributor");
    }

    #[test]
    fn serde_uses_string_form() {
        let address = Address::new("orders", "server01");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"orders@server01\"");

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);

        let undefined: Address = serde_json::from_str("\"\"").unwrap();
        assert!(undefined.is_undefined());
    }
}
