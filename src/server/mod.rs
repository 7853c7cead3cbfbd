//! HTTP server for routing, jobs, health and administration.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE streaming of serving events

pub mod api;
pub mod streaming;
