//! Background Idle Sweeper
//!
//! A background task that periodically evicts sessions whose connection has
//! not been used for longer than the idle timeout.
//!
//! ## Why Do We Need This?
//!
//! Session connections are created on first use and nothing tells the gateway
//! when an external session ends. Without reaping, every session that ever
//! existed would keep a backend socket open forever.
//!
//! ## Design
//!
//! The sweeper runs as a Tokio task and:
//! 1. Sleeps for the sweep interval (default: 60s)
//! 2. Wakes up and asks the registry to evict idle sessions
//! 3. Logs how many were evicted
//!
//! It holds only a weak reference to the registry, so a registry that is
//! dropped without being stopped does not keep itself alive through its own
//! sweeper.

use crate::session::registry::WeakRegistry;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A handle to the running idle sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct IdleSweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,

    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    /// Starts the sweeper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(registry: WeakRegistry, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sweeper_loop(registry, interval, shutdown_rx));

        info!(interval_ms = interval.as_millis() as u64, "Idle session sweeper started");

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Stops the sweeper and waits for the task to finish.
    ///
    /// A sweep that is already running completes first; none starts after
    /// this returns.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("Idle session sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The main sweeper loop.
async fn sweeper_loop(
    registry: WeakRegistry,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        // Wait for the interval or shutdown signal
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Idle sweeper received shutdown signal");
                    return;
                }
            }
        }

        let Some(registry) = registry.upgrade() else {
            debug!("Session registry dropped, idle sweeper exiting");
            return;
        };

        let evicted = registry.sweep_idle().await;
        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = registry.len(),
                "Idle sessions evicted"
            );
        }
    }
}
