//! Rate limiting middleware for axum.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use super::identity::IdentityResolver;
use crate::ratelimit::{Decision, RateLimiter};

/// Body returned with `429 Too Many Requests`.
pub const LIMIT_EXCEEDED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Shared state for [`rate_limit`].
#[derive(Clone)]
pub struct GateState {
    limiter: Arc<RateLimiter>,
    resolver: Arc<IdentityResolver>,
}

impl GateState {
    /// Create gate state from a shared limiter and identity resolver.
    pub fn new(limiter: Arc<RateLimiter>, resolver: IdentityResolver) -> Self {
        Self {
            limiter,
            resolver: Arc::new(resolver),
        }
    }
}

/// Admit or reject a request before it reaches the router.
///
/// Requests carrying a registered token are limited under the token's scope;
/// all others under the client address scope. A store failure rejects the
/// request with `500` rather than letting it through.
pub async fn rate_limit(State(state): State<GateState>, req: Request, next: Next) -> Response {
    let identity = state.resolver.resolve(&req);

    let decision = state
        .limiter
        .check(&identity.address, identity.token.as_deref())
        .await;

    match decision {
        Ok(Decision::Allowed) => next.run(req).await,
        Ok(denied) => {
            debug!(
                address = %identity.address,
                has_token = identity.token.is_some(),
                decision = ?denied,
                "Request rejected by rate limiter"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": LIMIT_EXCEEDED_MESSAGE })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, address = %identity.address, "Rate limit check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}
