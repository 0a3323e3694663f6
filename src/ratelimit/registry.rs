//! Scope registry and scope resolution.
//!
//! The registry holds one default scope, applied per client address, plus any
//! number of named scopes keyed by access token. A token only selects its own
//! scope when it matches a registered token exactly; anything else falls back to
//! the address scope.

use std::collections::HashMap;

use tracing::{info, warn};

use super::key::RateKey;
use super::scope::ScopeConfig;

/// The default scope plus the token scopes registered on top of it.
#[derive(Debug, Clone)]
pub struct ScopeRegistry {
    address_scope: ScopeConfig,
    token_scopes: HashMap<String, ScopeConfig>,
}

impl ScopeRegistry {
    /// Create a registry with the given address scope and no token scopes.
    pub fn new(address_scope: ScopeConfig) -> Self {
        Self {
            address_scope,
            token_scopes: HashMap::new(),
        }
    }

    /// Register a scope for `token`, replacing any previous scope for it.
    ///
    /// An empty token never identifies a client, so registering one is ignored.
    pub fn register(&mut self, token: impl Into<String>, scope: ScopeConfig) {
        let token = token.into();
        if token.is_empty() {
            warn!("Ignoring scope registered for an empty token");
            return;
        }
        info!(
            token = %token,
            limit = scope.request_limit(),
            window = ?scope.window(),
            block = ?scope.block_duration(),
            "Registered token scope"
        );
        self.token_scopes.insert(token, scope);
    }

    /// The scope applied to client addresses.
    pub fn address_scope(&self) -> &ScopeConfig {
        &self.address_scope
    }

    /// The scope registered for `token`, if any. Matching is exact and case-sensitive.
    pub fn token_scope(&self, token: &str) -> Option<&ScopeConfig> {
        self.token_scopes.get(token)
    }

    /// Number of registered token scopes.
    pub fn token_count(&self) -> usize {
        self.token_scopes.len()
    }

    /// Pick the key and scope for a request from `address`, optionally carrying `token`.
    pub fn resolve(&self, address: &str, token: Option<&str>) -> (RateKey, &ScopeConfig) {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => match self.token_scopes.get(token) {
                Some(scope) => (RateKey::token(token), scope),
                None => (RateKey::address(address), &self.address_scope),
            },
            None => (RateKey::address(address), &self.address_scope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scope(limit: u64) -> ScopeConfig {
        ScopeConfig::new(limit, Duration::from_secs(1), Duration::from_secs(60)).unwrap()
    }

    fn registry() -> ScopeRegistry {
        let mut registry = ScopeRegistry::new(scope(5));
        registry.register("abc123", scope(10));
        registry
    }

    #[test]
    fn test_resolve_without_token_uses_address() {
        let registry = registry();
        let (key, config) = registry.resolve("10.0.0.1", None);

        assert_eq!(key, RateKey::address("10.0.0.1"));
        assert_eq!(config.request_limit(), 5);
    }

    #[test]
    fn test_resolve_known_token() {
        let registry = registry();
        let (key, config) = registry.resolve("10.0.0.1", Some("abc123"));

        assert_eq!(key, RateKey::token("abc123"));
        assert_eq!(config.request_limit(), 10);
    }

    #[test]
    fn test_resolve_unknown_token_falls_back_to_address() {
        let registry = registry();

        assert_eq!(
            registry.resolve("10.0.0.1", Some("nope")),
            registry.resolve("10.0.0.1", None)
        );
    }

    #[test]
    fn test_resolve_empty_token_is_no_token() {
        let registry = registry();
        let (key, _) = registry.resolve("10.0.0.1", Some(""));

        assert_eq!(key, RateKey::address("10.0.0.1"));
    }

    #[test]
    fn test_token_match_is_case_sensitive() {
        let registry = registry();
        let (key, _) = registry.resolve("10.0.0.1", Some("ABC123"));

        assert_eq!(key, RateKey::address("10.0.0.1"));
        assert!(registry.token_scope("ABC123").is_none());
    }

    #[test]
    fn test_register_replaces_whole_scope() {
        let mut registry = registry();
        let replacement =
            ScopeConfig::new(2, Duration::from_secs(30), Duration::ZERO).unwrap();
        registry.register("abc123", replacement);

        assert_eq!(registry.token_count(), 1);
        assert_eq!(registry.token_scope("abc123"), Some(&replacement));
    }

    #[test]
    fn test_register_ignores_empty_token() {
        let mut registry = registry();
        registry.register("", scope(1));

        assert_eq!(registry.token_count(), 1);
        assert!(registry.token_scope("").is_none());
    }
}
