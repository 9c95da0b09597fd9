//! HTTP status endpoint of the broker daemon.
//!
//! | Route         | Body                                   |
//! |---------------|----------------------------------------|
//! | `GET /health` | [`BrokerHealth`](crate::broker::BrokerHealth), 503 once stopped |
//! | `GET /stats`  | [`BrokerStats`](crate::broker::BrokerStats) |

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::broker::BrokerMonitor;
use crate::error::Result;

/// `GET /health`: whether the relay reactor runs, and its uptime.
pub async fn health_handler(State(monitor): State<BrokerMonitor>) -> impl IntoResponse {
    let health = monitor.health();
    let status = if health.running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// `GET /stats`: broker and channel counters.
pub async fn stats_handler(State(monitor): State<BrokerMonitor>) -> impl IntoResponse {
    (StatusCode::OK, Json(monitor.snapshot()))
}

/// Builds the status router.
pub fn routes(monitor: BrokerMonitor) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(monitor)
}

/// Binds `addr` and serves the status routes until `token` is cancelled.
///
/// Returns the bound address and the server future; the caller decides where
/// to run it.
///
/// # Errors
///
/// Returns [`ZerobotError::Io`](crate::ZerobotError::Io) if the address
/// cannot be bound.
pub async fn bind(
    addr: SocketAddr,
    monitor: BrokerMonitor,
    token: CancellationToken,
) -> Result<(SocketAddr, impl Future<Output = std::io::Result<()>> + Send + 'static)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "status endpoint listening");
    let server = axum::serve(listener, routes(monitor))
        .with_graceful_shutdown(async move { token.cancelled_owned().await })
        .into_future();
    Ok((local, server))
}
