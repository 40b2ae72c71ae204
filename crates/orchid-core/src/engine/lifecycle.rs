//! Engine lifecycle: startup announcement, health monitoring, and graceful
//! shutdown.
//!
//! `LifecycleManager` wraps an [`Orchestrator`] and owns its background
//! tasks:
//! - a signal listener (Ctrl+C / SIGTERM) that flips the engine into
//!   shutdown mode,
//! - a health monitor that periodically logs engine counts and publishes a
//!   `Heartbeat` event.
//!
//! Shutdown sequence (`stop`):
//! 1. Set the shutdown flag -- new submissions are refused immediately.
//! 2. Wait for active workflows to drain, up to the configured grace
//!    period.
//! 3. Cancel and join the background tasks.
//! 4. Invoke registered shutdown callbacks in registration order.
//! 5. Clear the active-workflow and emitted-thunk registries, mark
//!    non-terminal workflow states Cancelled, and publish the shutdown
//!    notification.
//!
//! Both `start` and `stop` are idempotent; a stopped engine does not
//! restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use orchid_types::event::EngineEvent;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::dispatch::ThunkExecutor;
use crate::engine::scheduler::Orchestrator;

/// How often the drain loop re-checks the active-workflow count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Callback invoked during shutdown, after active workflows have drained.
pub type ShutdownCallback =
    Arc<dyn Fn() -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Owns the orchestrator's background tasks and drives graceful shutdown.
pub struct LifecycleManager<E: ThunkExecutor> {
    orchestrator: Arc<Orchestrator<E>>,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Cancels the signal listener and health monitor.
    monitor_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
}

impl<E: ThunkExecutor + 'static> LifecycleManager<E> {
    pub fn new(orchestrator: Orchestrator<E>) -> Self {
        Self::from_arc(Arc::new(orchestrator))
    }

    pub fn from_arc(orchestrator: Arc<Orchestrator<E>>) -> Self {
        Self {
            orchestrator,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            monitor_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped orchestrator, for submitting workflows.
    pub fn orchestrator(&self) -> &Arc<Orchestrator<E>> {
        &self.orchestrator
    }

    /// Register a callback to run during `stop`, after active workflows
    /// have drained. Callbacks run in registration order.
    pub async fn add_shutdown_callback(&self, callback: ShutdownCallback) {
        self.callbacks.lock().await.push(callback);
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Spawn the signal listener and health monitor, then publish the
    /// engine announcement. Subsequent calls are no-ops.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("lifecycle manager already started");
            return;
        }

        let mut background = self.background.lock().await;

        let signal_orchestrator = Arc::clone(&self.orchestrator);
        let signal_token = self.monitor_token.clone();
        background.push(tokio::spawn(async move {
            tokio::select! {
                _ = signal_token.cancelled() => {}
                _ = wait_for_termination_signal() => {
                    tracing::warn!("termination signal received; requesting shutdown");
                    signal_orchestrator.request_shutdown();
                }
            }
        }));

        let monitor_orchestrator = Arc::clone(&self.orchestrator);
        let monitor_token = self.monitor_token.clone();
        let interval_period = self.orchestrator.config().health_interval();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            loop {
                tokio::select! {
                    _ = monitor_token.cancelled() => break,
                    _ = interval.tick() => {
                        let active = monitor_orchestrator.active_count();
                        let tracked = monitor_orchestrator.tracked_workflow_count();
                        let thunks = monitor_orchestrator.total_thunks_emitted();
                        tracing::debug!(
                            active_workflows = active,
                            tracked_workflows = tracked,
                            thunks_emitted = thunks,
                            "engine heartbeat"
                        );
                        monitor_orchestrator.event_bus().publish(EngineEvent::Heartbeat {
                            active_workflows: active,
                            tracked_workflows: tracked,
                            total_thunks: thunks,
                        });
                    }
                }
            }
        }));
        drop(background);

        self.orchestrator.event_bus().publish(EngineEvent::EngineAnnounce {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: self.orchestrator.get_introspection_data(),
        });
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "engine started");
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    /// Gracefully shut the engine down. Subsequent calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("lifecycle manager already stopped");
            return;
        }

        self.orchestrator.request_shutdown();
        self.drain_active_workflows().await;

        self.monitor_token.cancel();
        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            let _ = handle.await;
        }
        drop(background);

        let callbacks: Vec<ShutdownCallback> = self.callbacks.lock().await.clone();
        for callback in callbacks {
            callback().await;
        }

        self.orchestrator.clear_registries();
        let cancelled = self.orchestrator.cancel_tracked_workflows();
        if cancelled > 0 {
            tracing::info!(count = cancelled, "marked unfinished workflows cancelled");
        }

        self.orchestrator.event_bus().publish(EngineEvent::ShutdownRequested {
            reason: "engine stop requested".to_string(),
        });
        tracing::info!("engine stopped");
    }

    /// Wait for in-flight workflows to finish, up to the configured grace
    /// period. Workflows still active afterwards are abandoned.
    async fn drain_active_workflows(&self) {
        let grace = self.orchestrator.config().shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;

        while self.orchestrator.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    active_workflows = self.orchestrator.active_count(),
                    grace_ms = grace.as_millis() as u64,
                    "shutdown grace period elapsed with workflows still active"
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Resolve when the process receives Ctrl+C or (on unix) SIGTERM.
async fn wait_for_termination_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
