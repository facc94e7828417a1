use tokio::signal;
use tracing::error;

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let handlers = signal::unix::signal(signal::unix::SignalKind::interrupt()).and_then(|int| {
            signal::unix::signal(signal::unix::SignalKind::terminate()).map(|term| (int, term))
        });

        match handlers {
            Ok((mut sigint, mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv()  => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handlers, falling back to Ctrl+C");
                let _ = signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shutdown_signal_waits() {
        let result = timeout(Duration::from_millis(100), shutdown_signal()).await;
        assert!(result.is_err(), "no signal was sent");
    }
}
