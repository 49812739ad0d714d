//! HTTP server bootstrap: binds a listener and serves an axum [`Router`],
//! with optional graceful shutdown. Kept separate from `rest_api` so the
//! listener lifecycle is testable independent of the route handlers.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::AppConfig;

/// Binds a listener on `127.0.0.1:<config.server.port>`.
///
/// # Errors
///
/// Returns an error if the address is already in use.
pub async fn bind(config: &AppConfig) -> std::io::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port.into_inner()));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Binds a listener on an OS-assigned port, for tests.
///
/// # Errors
///
/// Returns an error if no ports are available.
pub async fn bind_on_available_port() -> std::io::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Serves `router` on `listener` until the process exits.
///
/// # Errors
///
/// Returns an error if the underlying accept loop fails.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router).await.map_err(std::io::Error::other)
}

/// Serves `router` on `listener` until `shutdown` is cancelled, then drains
/// in-flight connections before returning.
///
/// # Errors
///
/// Returns an error if the underlying accept loop fails.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    let signal = async move { shutdown.cancelled().await };
    axum::serve(listener, router).with_graceful_shutdown(signal).await.map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest_api::ApiState;
    use std::sync::Arc;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn bind_on_available_port_returns_a_usable_address() {
        let (listener, addr) = bind_on_available_port().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        drop(listener);
    }

    #[tokio::test]
    async fn health_endpoint_responds_ok() {
        let (listener, addr) = bind_on_available_port().await.unwrap();
        let router = crate::rest_api::router(Arc::new(ApiState::for_testing().await));
        let handle = tokio::spawn(async move { serve(listener, router).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let client = reqwest::Client::new();
        let response = timeout(Duration::from_secs(1), client.get(format!("http://{addr}/api/v1/health")).send())
            .await
            .unwrap()
            .unwrap();
        assert!(response.status().is_success());
        handle.abort();
    }
}
