//! Signal handling: SIGINT/SIGTERM cancel the run, a second one abandons it.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => {
                error!("failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Cancel `token` on the first signal and `abort` on the second.
///
/// The first signal lets in-flight jobs stop within the grace period. The
/// second stops waiting for them; teardown and reports still run.
pub async fn cancel_on_signal(token: CancellationToken, abort: CancellationToken) {
    shutdown_signal().await;
    warn!("Interrupt received, cancelling jobs and cleaning up");
    token.cancel();

    shutdown_signal().await;
    warn!("Second interrupt received, abandoning in-flight jobs");
    abort.cancel();
}
