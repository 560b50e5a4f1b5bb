//! Begin/end/error hooks around inbound message processing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use unicast_core::headers;

use crate::context::{ProcessingContext, ProcessingState};
use crate::error::BusError;

// ---------------------------------------------------------------------------
// LifecycleHook trait
// ---------------------------------------------------------------------------

/// Cross-cutting callback bound to the processing of one inbound message.
///
/// Hooks are built fresh for every message by a [`HookProvider`], so an
/// implementation may keep per-message state (a unit of work, a timer).
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Name used in logs and in [`BusError::HookFailure`].
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs before the message is handed to the pipeline.
    async fn begin(&self, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the pipeline completed successfully.
    async fn end(&self, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the pipeline (or a begin hook) failed.
    async fn error(&self, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds the hook set for one inbound message.
pub trait HookProvider: Send + Sync {
    fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>>;
}

impl<F> HookProvider for F
where
    F: Fn() -> Vec<Arc<dyn LifecycleHook>> + Send + Sync,
{
    fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>> {
        self()
    }
}

// ---------------------------------------------------------------------------
// MessageLifecycle
// ---------------------------------------------------------------------------

/// Runs lifecycle hooks for inbound messages.
///
/// Begin hooks run in the order the provider returns them. End and error
/// hooks run in exactly the reverse of that order, over the same hook set
/// that was resolved for the message's begin phase.
pub struct MessageLifecycle {
    provider: Arc<dyn HookProvider>,
    endpoint_name: String,
    machine_name: String,
}

impl MessageLifecycle {
    #[must_use]
    pub fn new(
        provider: Arc<dyn HookProvider>,
        endpoint_name: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            endpoint_name: endpoint_name.into(),
            machine_name: machine_name.into(),
        }
    }

    /// Starts processing: annotates the message with this endpoint's
    /// identity, resolves the hook set, and runs every begin hook in order.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::HookFailure`] for the first begin hook that fails.
    /// Later begin hooks do not run. The full hook set stays recorded on
    /// `ctx`, so a subsequent [`MessageLifecycle::fail`] runs every error hook.
    pub async fn begin(&self, ctx: &ProcessingContext) -> Result<(), BusError> {
        if !ctx.enter() {
            debug!(message_id = %ctx.message_id(), "message processing already began");
            return Ok(());
        }

        ctx.set_header(headers::PROCESSING_ENDPOINT, &self.endpoint_name);
        ctx.set_header(headers::PROCESSING_MACHINE, &self.machine_name);

        let hooks = self.provider.hooks();
        ctx.set_hooks(hooks.clone());

        for hook in &hooks {
            debug!(hook = hook.name(), message_id = %ctx.message_id(), "begin hook");
            hook.begin(ctx)
                .await
                .map_err(|source| BusError::HookFailure {
                    hook: hook.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Finishes successful processing: end hooks in reverse order, then the
    /// context is cleared. Hook failures are logged and do not stop the
    /// remaining hooks.
    pub async fn end(&self, ctx: &ProcessingContext) {
        if !ctx.settle(ProcessingState::Completed) {
            return;
        }
        for hook in ctx.hooks().iter().rev() {
            debug!(hook = hook.name(), message_id = %ctx.message_id(), "end hook");
            if let Err(e) = hook.end(ctx).await {
                error!(hook = hook.name(), message_id = %ctx.message_id(), error = %e, "end hook failed");
            }
        }
        ctx.clear();
    }

    /// Finishes failed processing: error hooks in reverse order, then the
    /// context is cleared. A no-op if processing never began.
    pub async fn fail(&self, ctx: &ProcessingContext) {
        if !ctx.settle(ProcessingState::Failed) {
            return;
        }
        for hook in ctx.hooks().iter().rev() {
            debug!(hook = hook.name(), message_id = %ctx.message_id(), "error hook");
            if let Err(e) = hook.error(ctx).await {
                error!(hook = hook.name(), message_id = %ctx.message_id(), error = %e, "error hook failed");
            }
        }
        ctx.clear();
    }
}

impl std::fmt::Debug for MessageLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLifecycle")
            .field("endpoint_name", &self.endpoint_name)
            .field("machine_name", &self.machine_name)
            .finish_non_exhaustive()
    }
}
