//! HTTP request gate: identity extraction, the rate limiting middleware and the
//! server that mounts it.

mod identity;
mod middleware;
mod server;

pub use identity::{ClientIdentity, IdentityResolver, UNKNOWN_ADDRESS};
pub use middleware::{rate_limit, GateState, LIMIT_EXCEEDED_MESSAGE};
pub use server::GateServer;
