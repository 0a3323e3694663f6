//! Client identity extraction.
//!
//! The client address comes from the first `X-Forwarded-For` entry, then
//! `X-Real-IP`, then the peer socket address. Forwarding headers are consulted
//! only when the server sits behind a trusted proxy.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, Request};

use crate::error::{RatekeeperError, Result};

/// Address recorded when neither headers nor the connection reveal one.
pub const UNKNOWN_ADDRESS: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Resolved client address
    pub address: String,
    /// Access token, if the request carried a non-empty one
    pub token: Option<String>,
}

/// Extracts a [`ClientIdentity`] from request metadata.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    token_header: HeaderName,
    trust_forwarded_headers: bool,
}

impl IdentityResolver {
    /// Create a resolver reading the token from `token_header`.
    pub fn new(token_header: &str, trust_forwarded_headers: bool) -> Result<Self> {
        let token_header = HeaderName::from_bytes(token_header.as_bytes()).map_err(|e| {
            RatekeeperError::Config(format!("Invalid token header '{}': {}", token_header, e))
        })?;

        Ok(Self {
            token_header,
            trust_forwarded_headers,
        })
    }

    /// Resolve the identity of `req`.
    pub fn resolve<B>(&self, req: &Request<B>) -> ClientIdentity {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        ClientIdentity {
            address: self.client_address(req.headers(), peer),
            token: self.token(req.headers()),
        }
    }

    /// The client address from forwarding headers (when trusted) or the peer.
    pub fn client_address(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let forwarded = if self.trust_forwarded_headers {
            forwarded_for(headers).or_else(|| real_ip(headers))
        } else {
            None
        };

        forwarded
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
    }

    fn token(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.token_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    }
}

/// First (client-most) entry of `X-Forwarded-For`.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
}

fn real_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_REAL_IP)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
}
