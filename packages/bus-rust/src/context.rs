//! Per-inbound-message processing context.
//!
//! A `ProcessingContext` is created by the transport for every received
//! message and passed by reference through every event, hook, pipeline
//! invocation, and dispatch call made while that message is processed. It
//! is never stored in shared or global state, so concurrent messages on
//! different tasks cannot observe each other's context.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use unicast_core::TransportMessage;

use crate::lifecycle::LifecycleHook;

/// Lifecycle state of one inbound message.
///
/// State machine: Idle -> Processing -> (Completed | Failed) -> Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// Not yet begun, or finished and cleared.
    Idle,
    /// Begin hooks have run (or are running); handlers may execute.
    Processing,
    /// End hooks are running.
    Completed,
    /// Error hooks are running.
    Failed,
}

/// Whether the pipeline should keep invoking handlers for this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainControl {
    Continue,
    Abort,
}

/// The inbound message currently being processed by one execution unit.
pub struct ProcessingContext {
    message: RwLock<TransportMessage>,
    state: Mutex<ProcessingState>,
    cleared: AtomicBool,
    hooks: Mutex<Vec<Arc<dyn LifecycleHook>>>,
    handled_later: AtomicBool,
    aborted: AtomicBool,
}

impl ProcessingContext {
    #[must_use]
    pub fn new(message: TransportMessage) -> Self {
        Self {
            message: RwLock::new(message),
            state: Mutex::new(ProcessingState::Idle),
            cleared: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            handled_later: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessingState {
        *self.state.lock()
    }

    /// The message being processed, or `None` before processing begins and
    /// after it has been cleared.
    #[must_use]
    pub fn current_message(&self) -> Option<TransportMessage> {
        match self.state() {
            ProcessingState::Idle => None,
            _ => Some(self.message.read().clone()),
        }
    }

    /// Identifier of the wrapped message, regardless of state.
    #[must_use]
    pub fn message_id(&self) -> String {
        self.message.read().id.clone()
    }

    /// Asks the pipeline to stop invoking further handlers for this message.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Checked by the pipeline between handler invocations.
    #[must_use]
    pub fn chain_control(&self) -> ChainControl {
        if self.aborted.load(Ordering::SeqCst) {
            ChainControl::Abort
        } else {
            ChainControl::Continue
        }
    }

    #[must_use]
    pub fn handled_later(&self) -> bool {
        self.handled_later.load(Ordering::SeqCst)
    }

    /// Claims the single "handle later" slot. Returns `false` if it was
    /// already claimed during this processing.
    pub(crate) fn claim_handle_later(&self) -> bool {
        self.handled_later
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases the slot after a failed re-send so a later call may retry.
    pub(crate) fn release_handle_later(&self) {
        self.handled_later.store(false, Ordering::SeqCst);
    }

    /// Idle -> Processing. Only succeeds once per context.
    pub(crate) fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ProcessingState::Idle || self.cleared.load(Ordering::SeqCst) {
            return false;
        }
        *state = ProcessingState::Processing;
        true
    }

    /// Processing -> `outcome` (Completed or Failed).
    pub(crate) fn settle(&self, outcome: ProcessingState) -> bool {
        let mut state = self.state.lock();
        if *state != ProcessingState::Processing {
            return false;
        }
        *state = outcome;
        true
    }

    /// (Completed | Failed) -> Idle, permanently.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ProcessingState::Completed | ProcessingState::Failed) {
            *state = ProcessingState::Idle;
            self.cleared.store(true, Ordering::SeqCst);
        }
    }

    /// Returns `true` once processing has finished and the context was cleared.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }

    pub(crate) fn set_header(&self, key: &str, value: &str) {
        self.message.write().set_header(key, value);
    }

    pub(crate) fn set_hooks(&self, hooks: Vec<Arc<dyn LifecycleHook>>) {
        *self.hooks.lock() = hooks;
    }

    /// The hook set resolved for this message's begin phase.
    pub(crate) fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>> {
        self.hooks.lock().clone()
    }
}

impl fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("message_id", &self.message_id())
            .field("state", &self.state())
            .field("hooks", &self.hooks.lock().len())
            .field("handled_later", &self.handled_later())
            .field("chain_control", &self.chain_control())
            .finish()
    }
}
