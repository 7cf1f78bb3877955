use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, warn};

/// Spawn a task that raises `flag` on SIGINT or SIGTERM. The stream client
/// observes the flag on its next tick, closes the socket and returns.
pub fn install(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(i), Ok(t)) => (i, t),
                (Err(e), _) | (_, Err(e)) => {
                    error!("installing signal handlers: {e}");
                    return;
                }
            };
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
        warn!("shutdown signal received");
        super::set_ready(false);
        flag.store(true, Ordering::SeqCst);
    });
}
