//! Shared runtime glue: the program-wide shutdown future and signal
//! wiring, used identically by both daemons.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

/// How long either side of the handshake waits for the peer.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiving half of the program-wide shutdown future. Carries the signal
/// name (or another reason) once shutdown begins.
pub type ShutdownRx = watch::Receiver<Option<String>>;

/// Sending half of the shutdown future.
pub type ShutdownTx = watch::Sender<Option<String>>;

/// Create the shutdown channel, initially empty.
#[must_use]
pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(None)
}

/// Spawn the task that completes the shutdown future on `SIGINT` or
/// `SIGTERM`, carrying the signal name.
pub fn spawn_signal_task(shutdown_tx: ShutdownTx) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(%err, "failed to register SIGTERM");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(%err, "failed to register SIGINT");
                return;
            }
        };

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!(signal = name, "received shutdown signal");
        let _ = shutdown_tx.send(Some(name.to_string()));
    });
}
