//! Bus run state.
//!
//! Uses `ArcSwap` for lock-free reads on every dispatch. Writes happen only
//! under the bus start lock, so transitions stay monotonic.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::BusError;

/// State machine: `NotStarted` -> Starting -> Started -> `NotStarted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    NotStarted,
    /// Addresses are frozen and the startup action / transport start is running.
    Starting,
    Started,
}

#[derive(Debug)]
pub struct RunState {
    state: ArcSwap<BusState>,
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(BusState::NotStarted),
        }
    }

    #[must_use]
    pub fn get(&self) -> BusState {
        **self.state.load()
    }

    pub(crate) fn set(&self, state: BusState) {
        self.state.store(Arc::new(state));
    }

    /// Dispatch is allowed from the moment the bus enters `Starting`, so a
    /// startup action may already send.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotStarted`] before `start()` has been called or
    /// after shutdown.
    pub fn ensure_started(&self) -> Result<(), BusError> {
        match self.get() {
            BusState::NotStarted => Err(BusError::NotStarted),
            BusState::Starting | BusState::Started => Ok(()),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
