use std::io;

use tokio::signal;

/// Reason the interrupt future resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// Resolve on the first SIGINT or SIGTERM.
///
/// Handlers are registered when this future is first polled; a failure to
/// register is returned instead of silently never firing.
pub async fn wait_for_interrupt() -> io::Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut sigterm = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                Ok(ShutdownSignal::Interrupt)
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                Ok(ShutdownSignal::Terminate)
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On non-Unix systems, we only have Ctrl+C
        signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        Ok(ShutdownSignal::Interrupt)
    }
}
