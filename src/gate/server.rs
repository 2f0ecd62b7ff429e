//! HTTP server hosting the gate.

use std::net::SocketAddr;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, Gate};
use crate::error::Result;

/// Build the router: the gate in front of the downstream handler.
pub fn router(gate: Gate) -> Router {
    Router::new()
        .fallback(downstream)
        .layer(from_fn_with_state(gate, rate_limit))
}

/// Stand-in for the downstream service the gateway forwards to.
async fn downstream() -> &'static str {
    "OK"
}

/// HTTP server for the gateway.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The gate instance
    gate: Gate,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, gate: Gate) -> Self {
        Self { addr, gate }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, router(self.gate))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::gate::{Route, RouteTable};
    use crate::ratelimit::{MemoryCounterStore, RateLimitOptions, RateLimitRule, RateLimiter};

    fn gate() -> Gate {
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryCounterStore::default())));
        let routes = RouteTable::new(vec![Route::new(
            "/api/{everything}",
            ["GET"],
            RateLimitOptions::new(RateLimitRule::new("1m", 60.0, 1).unwrap()),
        )]);
        Gate::new(limiter, Arc::new(routes))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let _server = HttpServer::new(addr, gate());
    }

    #[tokio::test]
    async fn test_router_limits_routed_requests() {
        let app = router(gate());
        let get = |path: &str| Request::builder().uri(path).body(Body::empty()).unwrap();

        let response = app.clone().oneshot(get("/api/orders")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/api/orders")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let addr: SocketAddr = "127.0.0.1:18080".parse().unwrap();
        let server = HttpServer::new(addr, gate());
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
