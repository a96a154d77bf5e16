//! Graceful Shutdown Module
//!
//! Drives the replica through `Running -> Draining -> Closed` on SIGINT/SIGTERM: the accept
//! loop is told to stop, in-flight increments get a bounded grace period to finish and
//! release the distributed lock, then the coordination client is closed exactly once.

use crate::context::ServiceContext;
use crate::{CounterError, Result};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

/// Replica lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Closed,
}

/// Lifecycle state plus the number of increments currently in flight
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => LifecycleState::Running,
            DRAINING => LifecycleState::Draining,
            _ => LifecycleState::Closed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Register an increment that is about to take the lock.
    ///
    /// Returns `None` once draining has started. The count is raised before the state is
    /// checked, so the sequencer never observes zero in-flight work while an admitted
    /// increment is still heading for the lock.
    pub fn begin_increment(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            lifecycle: Arc::clone(self),
        };
        if self.is_running() {
            Some(guard)
        } else {
            None
        }
    }

    /// `Running -> Draining`; only the first caller gets `true`
    pub(crate) fn begin_draining(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `Closed` from any state; only the first caller gets `true`
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED
    }

    /// Wait until no increment is in flight or `grace_period` elapses.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn wait_for_drain(&self, grace_period: Duration) -> bool {
        let deadline = Instant::now() + grace_period;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(10))).await;
        }
    }
}

/// Marks one in-flight increment; dropping it ends the registration
#[derive(Debug)]
pub struct InFlightGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shutdown coordinator for graceful replica shutdown
pub struct ShutdownCoordinator {
    context: Arc<ServiceContext>,
    shutdown_sender: broadcast::Sender<()>,
    completed: watch::Sender<bool>,
    grace_period: Duration,
    close_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(context: Arc<ServiceContext>, grace_period: Duration, close_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);
        let (completed, _) = watch::channel(false);

        Self {
            context,
            shutdown_sender,
            completed,
            grace_period,
            close_timeout,
        }
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then run the shutdown sequence
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                CounterError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                CounterError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Run the shutdown sequence.
    ///
    /// Only the first caller runs it. Later callers wait until that run has finished
    /// and then return `Ok(())`. The first caller must not be cancelled midway, so run it
    /// on its own task.
    pub async fn initiate_shutdown(&self) -> Result<()> {
        let lifecycle = self.context.lifecycle();
        if !lifecycle.begin_draining() {
            debug!(
                "Shutdown already requested (state={:?}), waiting for it to finish",
                lifecycle.state()
            );
            self.wait_for_completion().await;
            return Ok(());
        }

        let result = self.run_sequence().await;
        self.completed.send_replace(true);
        result
    }

    async fn wait_for_completion(&self) {
        let mut completed = self.completed.subscribe();
        while !*completed.borrow_and_update() {
            if completed.changed().await.is_err() {
                break;
            }
        }
    }

    async fn run_sequence(&self) -> Result<()> {
        let lifecycle = self.context.lifecycle();

        info!(
            "Draining: refusing new increments, grace period {:?}",
            self.grace_period
        );

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        if lifecycle.wait_for_drain(self.grace_period).await {
            info!("All in-flight increments completed");
        } else {
            warn!(
                "Grace period elapsed with {} increments still in flight; their locks expire with the lease",
                lifecycle.in_flight()
            );
        }

        match timeout(self.close_timeout, self.context.teardown()).await {
            Ok(Ok(_)) => {
                info!("Graceful shutdown completed");
                Ok(())
            }
            Ok(Err(e)) => {
                // The process is exiting anyway; a failed close is not fatal
                warn!("Error closing coordination client: {}", e);
                Ok(())
            }
            Err(_) => {
                error!(
                    "Closing coordination client timed out after {:?}",
                    self.close_timeout
                );
                Err(CounterError::TimeoutError(
                    "Coordination client close timeout".to_string(),
                ))
            }
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Wait for the shutdown broadcast. A closed or lagged channel also counts as shutdown.
    ///
    /// Returns at once when shutdown was already observed.
    pub async fn wait_for_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Running);

        assert!(lifecycle.begin_draining());
        assert!(!lifecycle.begin_draining());
        assert_eq!(lifecycle.state(), LifecycleState::Draining);

        assert!(lifecycle.mark_closed());
        assert!(!lifecycle.mark_closed());
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert!(!lifecycle.begin_draining());
    }

    #[test]
    fn test_begin_increment_refused_after_draining() {
        let lifecycle = Arc::new(Lifecycle::new());

        let guard = lifecycle.begin_increment().expect("running lifecycle admits work");
        assert_eq!(lifecycle.in_flight(), 1);

        lifecycle.begin_draining();
        assert!(lifecycle.begin_increment().is_none());
        // The refused registration is released immediately
        assert_eq!(lifecycle.in_flight(), 1);

        drop(guard);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_drain_returns_early() {
        let lifecycle = Arc::new(Lifecycle::new());
        let guard = lifecycle.begin_increment().unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        let started = Instant::now();
        assert!(lifecycle.wait_for_drain(Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_times_out() {
        let lifecycle = Arc::new(Lifecycle::new());
        let _guard = lifecycle.begin_increment().unwrap();

        assert!(!lifecycle.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(lifecycle.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_observes_broadcast() {
        let (sender, receiver) = broadcast::channel(1);
        let mut signal = ShutdownSignal::new(receiver);
        assert!(!signal.shutdown_requested);

        sender.send(()).unwrap();
        signal.wait_for_shutdown().await;
        assert!(signal.shutdown_requested);

        // Observed once, observed for good
        tokio::time::timeout(Duration::from_millis(100), signal.wait_for_shutdown())
            .await
            .expect("second wait returns immediately");
    }
}
