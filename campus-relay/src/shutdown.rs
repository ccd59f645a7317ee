//! Graceful shutdown signal handling.

/// Resolves when the process receives SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// If a handler cannot be installed the failure is logged and that signal
/// is ignored; the future then waits on the remaining one.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("received SIGTERM, initiating shutdown"),
    }
}
