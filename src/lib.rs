//! UTXOracle Live core library.
//!
//! Exposes every pipeline component so the binary and integration
//! tests can wire them independently of `main`.

pub mod adapters;
pub mod aggregator;
pub mod api;
pub mod broadcaster;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod resolution;
pub mod tracker;
pub mod urgency;
pub mod ws;

pub use error::{OracleError, Result};
