//! HTTP server guarded by the rate limiting gate.

use std::net::SocketAddr;

use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, GateState};
use crate::error::{RatekeeperError, Result};

/// HTTP server whose every route sits behind the rate limiter.
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Limiter and identity resolution shared by all requests
    state: GateState,
}

impl GateServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, state: GateState) -> Self {
        Self { addr, state }
    }

    /// Build the router with the gate applied to all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .layer(middleware::from_fn_with_state(self.state.clone(), rate_limit))
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self.router();

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RatekeeperError::Server(e.to_string())
        })
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Request successful!",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{IdentityResolver, LIMIT_EXCEEDED_MESSAGE};
    use crate::ratelimit::{RateLimiter, ScopeConfig, ScopeRegistry};
    use crate::store::{CounterStore, MemoryStore};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const PEER: &str = "192.168.1.1:12345";

    fn scope(limit: u64) -> ScopeConfig {
        ScopeConfig::new(limit, Duration::from_secs(1), Duration::from_secs(60)).unwrap()
    }

    fn server_with(store: Arc<dyn CounterStore>, address_limit: u64, tokens: &[(&str, u64)]) -> GateServer {
        let mut registry = ScopeRegistry::new(scope(address_limit));
        for (token, limit) in tokens {
            registry.register(*token, scope(*limit));
        }
        let limiter = Arc::new(RateLimiter::new(store, registry));
        let resolver = IdentityResolver::new("API_KEY", true).unwrap();
        GateServer::new(PEER.parse().unwrap(), GateState::new(limiter, resolver))
    }

    fn server(address_limit: u64, tokens: &[(&str, u64)]) -> GateServer {
        server_with(Arc::new(MemoryStore::new()), address_limit, tokens)
    }

    fn request(path: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(PEER.parse().unwrap()));
        req
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_address_limit_returns_429() {
        let router = server(3, &[]).router();

        for _ in 0..3 {
            let (status, body) = send(&router, request("/", None)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "Request successful!");
        }

        let (status, body) = send(&router, request("/", None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], LIMIT_EXCEEDED_MESSAGE);
    }

    #[tokio::test]
    async fn test_token_limit_applies_to_token_requests() {
        let router = server(2, &[("abc123", 5)]).router();

        for _ in 0..5 {
            let (status, _) = send(&router, request("/", Some("abc123"))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, _) = send(&router, request("/", Some("abc123"))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_token_overrides_address_limit() {
        let router = server(1, &[("abc123", 3)]).router();

        let (status, _) = send(&router, request("/", None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, request("/", None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let router = server(1, &[("abc123", 3)]).router();
        for _ in 0..3 {
            let (status, _) = send(&router, request("/", Some("abc123"))).await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_limited_by_address() {
        let router = server(1, &[("abc123", 3)]).router();

        let (status, _) = send(&router, request("/", Some("nope"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, request("/", None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_health_route_is_gated() {
        let router = server(1, &[]).router();

        let (status, body) = send(&router, request("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, _) = send(&router, request("/health", None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_store_failure_returns_500() {
        let store = Arc::new(MemoryStore::new());
        store.close().await.unwrap();
        let router = server_with(store, 10, &[]).router();

        let (status, _) = send(&router, request("/", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
