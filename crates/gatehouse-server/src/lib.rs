//! Gatehouse HTTP server
//!
//! REST API server for the Gatehouse policy decision engine: batch
//! evaluation, compile-to-filter translation, data and policy management,
//! health and metrics.

pub mod accept;
pub mod body;
pub mod decision_log;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

#[cfg(test)]
mod tests;
