//! HTTP gate: route resolution and the rate limiting middleware.

mod middleware;
mod routes;
mod server;

pub use middleware::{rate_limit, Gate, GateDecision};
pub use routes::{PathTemplate, ResolvedRoute, Route, RouteTable};
pub use server::{router, HttpServer};
