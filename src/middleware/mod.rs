//! Middleware for observability on the read-only HTTP API.

pub mod logging;

pub use logging::request_logging;
