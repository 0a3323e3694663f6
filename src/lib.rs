//! Ratekeeper - per-client HTTP rate limiting
//!
//! This crate limits request rates per client address, or per access token when
//! the request carries a registered one. Requests are counted in fixed windows;
//! a client that goes over its limit is blocked for a cool-down period. Counters
//! and blocks live in a pluggable store (in-memory or Redis).

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;
