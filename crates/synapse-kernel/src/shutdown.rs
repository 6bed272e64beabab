//! Coordinated kernel shutdown.
//!
//! On the first [`ShutdownTrigger`] the coordinator stops the router from
//! accepting work, tells listeners to stop, broadcasts `control/shutdown` to
//! every registered module, waits for their acknowledgements up to a fixed
//! deadline and finally clears the registries.  Later triggers are ignored.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;

use crate::envelope::{ModuleId, duration_millis};
use crate::module::ModuleHandle;
use crate::router::Router;
use crate::transport::CallRequest;

/// Extra time allowed past the deadline for transports to unwind.
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

const PHASE_RUNNING: u8 = 0;
const PHASE_DRAINING: u8 = 1;
const PHASE_DONE: u8 = 2;

/// Why the kernel is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    User1,
    User2,
    /// An unrecoverable local fault (panic, listener failure).
    Fault,
    /// Explicit exit request with the given code.
    Exit(i32),
}

impl ShutdownTrigger {
    /// Process exit code for this trigger.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt | Self::Terminate | Self::User1 | Self::User2 => 0,
            Self::Fault => 1,
            Self::Exit(code) => code,
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
            Self::User1 => f.write_str("user1"),
            Self::User2 => f.write_str("user2"),
            Self::Fault => f.write_str("fault"),
            Self::Exit(code) => write!(f, "exit({code})"),
        }
    }
}

/// Outcome of one shutdown sequence.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    /// Modules the directive was sent to.
    pub modules: usize,
    pub acknowledged: usize,
    pub unacknowledged: Vec<ModuleId>,
    pub elapsed: Duration,
    pub exit_code: i32,
}

/// Runs the shutdown sequence at most once.
pub struct ShutdownCoordinator {
    router: Arc<Router>,
    deadline: Duration,
    phase: AtomicU8,
    stop: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new(router: Arc<Router>, deadline: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            router,
            deadline,
            phase: AtomicU8::new(PHASE_RUNNING),
            stop,
        }
    }

    /// Receiver that flips to `true` when listeners must stop accepting.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase.load(Ordering::Acquire) != PHASE_RUNNING
    }

    /// Whether the sequence has finished and the registries are empty.
    pub fn is_complete(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_DONE
    }

    /// Run the shutdown sequence.
    ///
    /// Returns `None` if a shutdown is already in progress or finished.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> Option<ShutdownReport> {
        if self
            .phase
            .compare_exchange(PHASE_RUNNING, PHASE_DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(trigger = %trigger, "shutdown already in progress, ignoring trigger");
            return None;
        }

        let started = Instant::now();
        tracing::info!(trigger = %trigger, "kernel shutting down");

        self.router.begin_shutdown();
        self.stop.send_replace(true);

        let handles = self.router.modules();
        let modules = handles.len();
        let (acknowledged, unacknowledged) = self.broadcast(&handles).await;

        let cleared = self.router.clear();
        self.phase.store(PHASE_DONE, Ordering::Release);

        let report = ShutdownReport {
            trigger,
            modules,
            acknowledged,
            unacknowledged,
            elapsed: started.elapsed(),
            exit_code: trigger.exit_code(),
        };

        if report.unacknowledged.is_empty() {
            tracing::info!(
                modules,
                cleared,
                elapsed_ms = duration_millis(report.elapsed),
                exit_code = report.exit_code,
                "shutdown complete"
            );
        } else {
            let missing: Vec<&str> = report.unacknowledged.iter().map(ModuleId::as_str).collect();
            tracing::warn!(
                modules,
                acknowledged,
                unacknowledged = ?missing,
                elapsed_ms = duration_millis(report.elapsed),
                exit_code = report.exit_code,
                "shutdown complete with unacknowledged modules"
            );
        }

        Some(report)
    }

    /// Send `control/shutdown` to every handle and wait, bounded by the
    /// deadline, for them to settle.
    async fn broadcast(&self, handles: &[Arc<ModuleHandle>]) -> (usize, Vec<ModuleId>) {
        let calls = handles.iter().map(|handle| {
            let request = CallRequest::shutdown(self.deadline);
            tracing::debug!(module = ?handle.info(), "sending shutdown directive");
            async move {
                match handle.transport().call(request).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::debug!(module_id = %handle.id(), error = %e, "shutdown not acknowledged");
                        false
                    }
                }
            }
        });

        match tokio::time::timeout(self.deadline + DEADLINE_GRACE, join_all(calls)).await {
            Ok(acks) => {
                let acknowledged = acks.iter().filter(|ack| **ack).count();
                let unacknowledged = handles
                    .iter()
                    .zip(&acks)
                    .filter(|(_, ack)| !**ack)
                    .map(|(h, _)| h.id().clone())
                    .collect();
                (acknowledged, unacknowledged)
            }
            Err(_) => {
                tracing::warn!(
                    deadline_ms = duration_millis(self.deadline),
                    "shutdown deadline elapsed"
                );
                (0, handles.iter().map(|h| h.id().clone()).collect())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
