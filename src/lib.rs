//! Turnstile - Rate Limiting Gate for an API Gateway
//!
//! This crate implements the rate limiting stage of an API gateway: per
//! request it decides, from a per-route quota, whether to admit or reject
//! the request, and it keeps the counters, retry hints and response headers
//! needed to enforce that quota under concurrent load. Counters live in a
//! local store or are shared between instances over a gossip mesh.

pub mod config;
pub mod error;
pub mod gate;
pub mod mesh;
pub mod ratelimit;
