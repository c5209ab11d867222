//! Process signals.

use jitter_error::{ErrorContext as _, GenericError};
use tracing::info;

/// Waits until the process is asked to shut down.
///
/// Resolves on SIGINT (Ctrl-C) and, on Unix platforms, SIGTERM. Returns the name of the signal that was received.
///
/// # Errors
///
/// If the signal handlers cannot be installed, an error is returned.
pub async fn wait_for_shutdown_signal() -> Result<&'static str, GenericError> {
    #[cfg(unix)]
    {
        use tokio::{
            select,
            signal::unix::{signal, SignalKind},
        };

        let mut sigint_handler = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
        let mut sigterm_handler = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

        let signal_name = select! {
            _ = sigint_handler.recv() => "SIGINT",
            _ = sigterm_handler.recv() => "SIGTERM",
        };

        info!(signal = signal_name, "Received shutdown signal.");
        Ok(signal_name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .error_context("Failed to wait for Ctrl-C.")?;

        info!(signal = "ctrl-c", "Received shutdown signal.");
        Ok("ctrl-c")
    }
}
