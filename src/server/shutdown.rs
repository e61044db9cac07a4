//! Graceful shutdown for the deployer process
//!
//! A `watch` channel carries a single "stop" flag from the signal handler to
//! the HTTP server. Rollouts already running in the background are not
//! waited for; their records keep whatever status they last persisted.

use tokio::sync::watch;
use tracing::info;

/// Receiving half, cloned into every component that must stop on shutdown
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered or the controller is dropped
    pub async fn wait(&mut self) {
        // A dropped sender ends the wait too
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending half, owned by `main`
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
        info!("Shutdown signal sent");
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return the signal's name
///
/// Errors if the handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}
