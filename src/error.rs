//! Error taxonomy for the real-time pipeline.
//!
//! Mirrors the propagation policy: adapters and per-subscriber writers
//! recover locally and never propagate; `StoreIntegrityError` and
//! `ConfigError` are fatal and terminate the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    /// Transient upstream failure; the adapter retries with backoff.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Permanent encoding/version mismatch; the adapter enters FAILED.
    #[error("source protocol error: {0}")]
    SourceProtocolError(String),

    /// Transient store lock or I/O; retried with backoff, then surfaced.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Schema mismatch or corruption; fatal.
    #[error("store integrity error: {0}")]
    StoreIntegrityError(String),

    /// Classifier degrades gracefully rather than erroring the pipeline.
    #[error("insufficient input data: {0}")]
    InsufficientInputData(String),

    /// Subscriber dropped because its queue saturated; counters only.
    #[error("backpressure eviction: subscriber {0}")]
    BackpressureEviction(String),

    /// Soft/hard memory limits breached.
    #[error("memory pressure: {0}")]
    MemoryPressure(String),

    /// Fatal at startup.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Per-connection WebSocket auth failure (close code 1008).
    #[error("auth failure: {0}")]
    AuthFailure(String),
}

impl OracleError {
    /// True for the two variants that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OracleError::StoreIntegrityError(_) | OracleError::ConfigError(_)
        )
    }
}

impl From<rusqlite::Error> for OracleError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                OracleError::StoreUnavailable(e.to_string())
            }
            other => OracleError::StoreIntegrityError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(e: reqwest::Error) -> Self {
        OracleError::SourceUnavailable(e.to_string())
    }
}

impl From<bitcoincore_rpc::Error> for OracleError {
    fn from(e: bitcoincore_rpc::Error) -> Self {
        use bitcoincore_rpc::jsonrpc::Error as JsonRpcError;
        match &e {
            bitcoincore_rpc::Error::JsonRpc(JsonRpcError::Transport(_))
            | bitcoincore_rpc::Error::Io(_) => OracleError::SourceUnavailable(e.to_string()),
            _ => OracleError::SourceProtocolError(e.to_string()),
        }
    }
}

impl From<zmq::Error> for OracleError {
    fn from(e: zmq::Error) -> Self {
        OracleError::SourceUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;
