//! HTTP API
//!
//! JSON over axum. The caller is identified by the `x-user-id` header set by
//! the upstream auth gateway.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{build_app, ApiServer};
