//! Shutdown signal handling
//!
//! On Unix, SIGINT, SIGTERM, and SIGQUIT all request a graceful drain.
//! Elsewhere only Ctrl-C is observed.

use tokio_util::sync::CancellationToken;

/// Wait for a termination signal, returning its name
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Cancel `token` on the first termination signal
///
/// Returns once the token is cancelled, by a signal or by someone else.
pub async fn cancel_on_shutdown_signal(token: CancellationToken) {
    tokio::select! {
        signal = wait_for_shutdown_signal() => match signal {
            Ok(name) => tracing::info!(signal = name, "Shutdown requested, draining consumers"),
            Err(e) => tracing::error!(error = %e, "Failed to install signal handlers, shutting down"),
        },
        _ = token.cancelled() => return,
    }
    token.cancel();
}
