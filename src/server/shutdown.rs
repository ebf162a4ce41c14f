use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Resolves on Ctrl+C, SIGTERM or when `token` is cancelled. The token is
/// cancelled on the way out so that every other task observes the shutdown.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(?error, "Failed to install the Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(?error, "Failed to install the SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => tracing::info!("Shutdown requested"),
    }

    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_when_token_is_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        shutdown_signal(token.clone()).await;
        assert!(token.is_cancelled());
    }
}
