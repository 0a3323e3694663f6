//! Core rate limiter implementation.

use std::sync::Arc;

use tracing::{debug, trace};

use super::key::RateKey;
use super::registry::ScopeRegistry;
use super::scope::ScopeConfig;
use crate::error::Result;
use crate::store::CounterStore;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is within its scope's limit
    Allowed,
    /// This request pushed the count past the limit and started a block
    OverLimit,
    /// The subject was already blocked; nothing was counted
    Blocked,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// The decision engine: resolves scopes and runs the fixed-window algorithm
/// against a [`CounterStore`].
///
/// The limiter holds no per-request state and can be shared behind an `Arc`.
/// Scopes can only be registered through `&mut self`, so registration is
/// finished before the limiter is shared with request handlers.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    registry: ScopeRegistry,
}

impl RateLimiter {
    /// Create a rate limiter over `store` with the scopes in `registry`.
    pub fn new(store: Arc<dyn CounterStore>, registry: ScopeRegistry) -> Self {
        Self { store, registry }
    }

    /// Add or replace the scope for `token`.
    pub fn register_scope(&mut self, token: impl Into<String>, scope: ScopeConfig) {
        self.registry.register(token, scope);
    }

    /// The registered scopes.
    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    /// Check a request from `address`, optionally carrying `token`.
    ///
    /// A registered token is limited under its own scope. An unknown or empty token
    /// is treated as no token and the address scope applies.
    pub async fn check(&self, address: &str, token: Option<&str>) -> Result<Decision> {
        let (key, scope) = self.registry.resolve(address, token);
        self.check_and_consume(&key, scope).await
    }

    /// Check a request under the address scope.
    pub async fn check_by_address(&self, address: &str) -> Result<Decision> {
        let key = RateKey::address(address);
        self.check_and_consume(&key, self.registry.address_scope())
            .await
    }

    /// Check a request under the scope registered for `token`.
    ///
    /// An unregistered token is reported as allowed without touching the store;
    /// the caller is expected to fall back to [`RateLimiter::check_by_address`].
    pub async fn check_by_token(&self, token: &str) -> Result<Decision> {
        let Some(scope) = self.registry.token_scope(token) else {
            trace!("Token has no registered scope");
            return Ok(Decision::Allowed);
        };

        let key = RateKey::token(token);
        self.check_and_consume(&key, scope).await
    }

    /// Run one fixed-window decision for `key` under `scope`.
    ///
    /// A blocked key is denied without being counted. Otherwise the counter is
    /// incremented and, if the new count exceeds the limit, the key is blocked for
    /// the scope's block duration. Each store call is made at most once and any
    /// store failure is returned as an error rather than a decision.
    pub async fn check_and_consume(&self, key: &RateKey, scope: &ScopeConfig) -> Result<Decision> {
        let store_key = key.to_store_key();

        trace!(key = %key, limit = scope.request_limit(), "Checking rate limit");

        if self.store.is_blocked(&store_key).await? {
            trace!(key = %key, "Key is blocked");
            return Ok(Decision::Blocked);
        }

        let count = self.store.increment(&store_key, scope.window()).await?;

        if scope.is_exceeded_by(count) {
            self.store
                .block(&store_key, scope.block_duration())
                .await?;
            debug!(
                key = %key,
                count = count,
                limit = scope.request_limit(),
                block = ?scope.block_duration(),
                "Rate limit exceeded"
            );
            return Ok(Decision::OverLimit);
        }

        Ok(Decision::Allowed)
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        Ok(())
    }
}
