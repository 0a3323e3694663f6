//! Rate limiting decisions: scopes, keys and the fixed-window engine.

mod key;
mod limiter;
mod registry;
mod scope;

pub use key::RateKey;
pub use limiter::{Decision, RateLimiter};
pub use registry::ScopeRegistry;
pub use scope::ScopeConfig;
