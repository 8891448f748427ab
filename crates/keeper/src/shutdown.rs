//! Graceful shutdown signaling.
//!
//! Bridges SIGTERM/SIGINT into the async runtime as a watch channel both
//! daemon loops can select on. The contract is "finish the current unit of
//! work, then exit": the issuer completes an in-flight publish, the watcher
//! drains before stopping.

use tokio::sync::watch;
use tracing::{debug, info};

/// Receiving side of the shutdown notification. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending side, held by whoever decides when to stop (the signal listener,
/// or a test).
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create an unconnected shutdown pair.
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// Wait until shutdown is requested. Returns immediately if it already
    /// was.
    pub async fn recv(&mut self) {
        // An Err means the sender is gone, which we treat as shutdown.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking check, for loops that are between suspension points.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        debug!("Shutdown requested");
        let _ = self.tx.send(true);
    }
}

/// Spawn the OS signal listener and return the shutdown receiver.
///
/// SIGTERM and SIGINT both trigger a graceful stop.
pub fn listen_for_signals() -> std::io::Result<Shutdown> {
    use tokio::signal::unix::{signal, SignalKind};

    let (handle, shutdown) = Shutdown::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
        handle.shutdown();
    });

    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let (handle, shutdown) = Shutdown::new();
        assert!(!shutdown.is_shutdown());

        let mut waiter = shutdown.clone();
        let task = tokio::spawn(async move {
            waiter.recv().await;
        });

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_recv_after_shutdown_returns_immediately() {
        let (handle, mut shutdown) = Shutdown::new();
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .expect("recv should not block after shutdown");
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_shutdown() {
        let (handle, mut shutdown) = Shutdown::new();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .expect("recv should return when the sender is gone");
    }
}
