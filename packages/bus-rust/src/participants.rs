//! Startup/shutdown coordination of background participants.
//!
//! Participants are independent units (an auxiliary listener, a timeout
//! poller) started alongside the bus and stopped when it shuts down. Each
//! runs on its own spawned task so a slow participant cannot hold up the
//! others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// StartupParticipant trait
// ---------------------------------------------------------------------------

/// Background unit started and stopped with the bus.
#[async_trait]
pub trait StartupParticipant: Send + Sync + 'static {
    /// Identity used in logs and in the [`ShutdownReport`].
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// Supplies the participant set, resolved once per bus start.
pub trait ParticipantProvider: Send + Sync {
    fn participants(&self) -> Vec<Arc<dyn StartupParticipant>>;
}

impl<F> ParticipantProvider for F
where
    F: Fn() -> Vec<Arc<dyn StartupParticipant>> + Send + Sync,
{
    fn participants(&self) -> Vec<Arc<dyn StartupParticipant>> {
        self()
    }
}

// ---------------------------------------------------------------------------
// ShutdownReport
// ---------------------------------------------------------------------------

/// Outcome of stopping the participants. Shutdown never fails; this is what
/// it observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Participants whose stop returned successfully.
    pub stopped: Vec<String>,
    /// Participants whose stop returned an error or panicked. They are
    /// treated as stopped.
    pub failed: Vec<String>,
    /// Participants still stopping when the timeout elapsed.
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    /// `true` when every participant stopped cleanly within the timeout.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ParticipantCoordinator
// ---------------------------------------------------------------------------

struct Running {
    participants: Vec<Arc<dyn StartupParticipant>>,
    starts: Vec<JoinHandle<()>>,
}

/// Starts participants concurrently and stops them under a bounded timeout.
pub struct ParticipantCoordinator {
    provider: Arc<dyn ParticipantProvider>,
    timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl ParticipantCoordinator {
    #[must_use]
    pub fn new(provider: Arc<dyn ParticipantProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            running: Mutex::new(None),
        }
    }

    /// Resolves the participant set and launches every start on its own
    /// task. Returns without waiting; start failures are logged.
    ///
    /// Returns the number of participants launched. A second call while
    /// participants are running launches nothing.
    pub fn start(&self) -> usize {
        let mut running = self.running.lock();
        if running.is_some() {
            return 0;
        }

        let participants = self.provider.participants();
        let starts = participants
            .iter()
            .map(|participant| {
                let participant = Arc::clone(participant);
                tokio::spawn(async move {
                    debug!(participant = participant.name(), "starting participant");
                    if let Err(e) = participant.start().await {
                        error!(participant = participant.name(), error = %e, "participant failed to start");
                    }
                })
            })
            .collect();

        let count = participants.len();
        *running = Some(Running {
            participants,
            starts,
        });
        count
    }

    /// Waits for every pending start to finish, then stops all participants
    /// concurrently. Waits at most the configured timeout for the stops;
    /// stragglers are logged by name and left running.
    pub async fn stop(&self) -> ShutdownReport {
        let Some(running) = self.running.lock().take() else {
            return ShutdownReport::default();
        };

        for start in running.starts {
            if let Err(e) = start.await {
                error!(error = %e, "participant start task panicked");
            }
        }

        let pending: Vec<(String, JoinHandle<anyhow::Result<()>>)> = running
            .participants
            .into_iter()
            .map(|participant| {
                let name = participant.name().to_string();
                let handle = tokio::spawn(async move { participant.stop().await });
                (name, handle)
            })
            .collect();

        let mut report = ShutdownReport::default();
        let deadline = tokio::time::Instant::now() + self.timeout;

        // A finished stop is collected even after the deadline has passed,
        // because the timeout polls the handle before checking the clock.
        for (name, mut handle) in pending {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {
                    debug!(participant = %name, "participant stopped");
                    report.stopped.push(name);
                }
                Ok(Ok(Err(e))) => {
                    error!(participant = %name, error = %e, "participant failed to stop");
                    report.failed.push(name);
                }
                Ok(Err(e)) => {
                    error!(participant = %name, error = %e, "participant stop task panicked");
                    report.failed.push(name);
                }
                Err(_) => report.timed_out.push(name),
            }
        }

        if report.timed_out.is_empty() {
            info!(
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "participants stopped"
            );
        } else {
            // Names come from the report returned to the caller.
            #[allow(clippy::cast_possible_truncation)]
            let timeout_ms = self.timeout.as_millis() as u64;
            warn!(
                participants = ?report.timed_out,
                timeout_ms,
                "participants did not stop within the shutdown timeout"
            );
        }
        report
    }

    /// Whether participants were started and not yet stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl std::fmt::Debug for ParticipantCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantCoordinator")
            .field("timeout", &self.timeout)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
