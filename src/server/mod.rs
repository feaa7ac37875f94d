//! HTTP servers.

/// REST API server
pub mod api;

/// Metrics HTTP server
pub mod metrics;

/// Graceful shutdown handling
pub mod shutdown;
