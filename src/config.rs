//! Configuration surface (§6). Loaded once at startup from the
//! environment (optionally via a `.env` file); immutable thereafter.
//! Parsing failures are a fatal `ConfigError` (§7, §A.3).

use crate::error::OracleError;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub whale_threshold_btc: f64,
    pub whale_db_path: String,
    pub price_tick_interval_ms: u64,
    pub rolling_window_hours: u64,
    pub min_samples: usize,
    pub min_emit_confidence: f64,
    pub emit_delta_rel: f64,
    pub max_search_iterations: u32,
    pub max_step_rel: f64,
    pub auth_enabled: bool,
    pub auth_secret_key: String,
    pub auth_timeout: Duration,
    pub ws_host: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub retention_days: i64,
    pub soft_mem_limit_mb: u64,
    pub hard_mem_limit_mb: u64,
    pub accuracy_warn: f64,
    pub accuracy_crit: f64,
    pub stale_snapshot_max_age: Duration,
    pub drop_timeout: Duration,
    pub cache_max_size: usize,
    pub subscriber_queue_size: usize,
    pub subscriber_rate_limit_per_sec: u32,
    pub circuit_breaker_threshold: u32,
    pub rpc_url: Option<String>,
    pub rpc_cookie_path: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub rpc_conf_path: Option<String>,
    pub zmq_rawtx_endpoint: String,
    pub zmq_rawblock_endpoint: String,
    pub fee_market_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, OracleError> {
        let whale_threshold_btc = env_parsed("WHALE_THRESHOLD_BTC", 100.0);
        let min_samples = env_parsed("MIN_SAMPLES", 1000usize);
        let ws_port = env_parsed("WS_PORT", 8765u16);
        let http_port = env_parsed("HTTP_PORT", 8001u16);
        let accuracy_warn = env_parsed("ACCURACY_WARN", 0.75);
        let accuracy_crit = env_parsed("ACCURACY_CRIT", 0.70);

        if whale_threshold_btc <= 0.0 {
            return Err(OracleError::ConfigError(
                "WHALE_THRESHOLD_BTC must be positive".into(),
            ));
        }
        if min_samples == 0 {
            return Err(OracleError::ConfigError(
                "MIN_SAMPLES must be positive".into(),
            ));
        }
        if accuracy_crit > accuracy_warn {
            return Err(OracleError::ConfigError(
                "ACCURACY_CRIT must not exceed ACCURACY_WARN".into(),
            ));
        }

        Ok(Self {
            whale_threshold_btc,
            whale_db_path: env::var("WHALE_DB_PATH")
                .unwrap_or_else(|_| default_data_path("utxoracle.db")),
            price_tick_interval_ms: env_parsed("PRICE_TICK_INTERVAL_MS", 500u64),
            rolling_window_hours: env_parsed("ROLLING_WINDOW_HOURS", 3u64),
            min_samples,
            min_emit_confidence: env_parsed("MIN_EMIT_CONFIDENCE", 0.8),
            emit_delta_rel: env_parsed("EMIT_DELTA_REL", 0.002),
            max_search_iterations: env_parsed("MAX_SEARCH_ITERATIONS", 6u32),
            max_step_rel: env_parsed("MAX_STEP_REL", 0.05),
            auth_enabled: env_flag("AUTH_ENABLED", true),
            auth_secret_key: env::var("AUTH_SECRET_KEY")
                .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".into()),
            auth_timeout: Duration::from_secs(env_parsed("AUTH_TIMEOUT_SECS", 5u64)),
            ws_host: env::var("WS_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            ws_port,
            http_port,
            retention_days: env_parsed("RETENTION_DAYS", 90i64),
            soft_mem_limit_mb: env_parsed("SOFT_MEM_LIMIT_MB", 400u64),
            hard_mem_limit_mb: env_parsed("HARD_MEM_LIMIT_MB", 800u64),
            accuracy_warn,
            accuracy_crit,
            stale_snapshot_max_age: Duration::from_secs(
                env_parsed("STALE_SNAPSHOT_MAX_AGE_SECS", 600u64),
            ),
            drop_timeout: Duration::from_secs(env_parsed("DROP_TIMEOUT_SECS", 7200u64)),
            cache_max_size: env_parsed("CACHE_MAX_SIZE", 200_000usize),
            subscriber_queue_size: env_parsed("SUBSCRIBER_QUEUE_SIZE", 256usize),
            subscriber_rate_limit_per_sec: env_parsed("SUBSCRIBER_RATE_LIMIT_PER_SEC", 50u32),
            circuit_breaker_threshold: env_parsed("CIRCUIT_BREAKER_THRESHOLD", 10u32),
            rpc_url: env::var("BITCOIN_RPC_URL").ok(),
            rpc_cookie_path: env::var("BITCOIN_RPC_COOKIE").ok(),
            rpc_user: env::var("BITCOIN_RPC_USER").ok(),
            rpc_password: env::var("BITCOIN_RPC_PASSWORD").ok(),
            rpc_conf_path: env::var("BITCOIN_CONF_PATH").ok(),
            zmq_rawtx_endpoint: env::var("ZMQ_RAWTX_ENDPOINT")
                .unwrap_or_else(|_| "tcp://127.0.0.1:28332".into()),
            zmq_rawblock_endpoint: env::var("ZMQ_RAWBLOCK_ENDPOINT")
                .unwrap_or_else(|_| "tcp://127.0.0.1:28333".into()),
            fee_market_url: env::var("FEE_MARKET_URL").ok(),
        })
    }
}

fn default_data_path(filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

pub fn load_env() {
    let _ = dotenv::dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_whale_threshold() {
        env::set_var("WHALE_THRESHOLD_BTC", "0");
        let result = Config::from_env();
        env::remove_var("WHALE_THRESHOLD_BTC");
        assert!(matches!(result, Err(OracleError::ConfigError(_))));
    }

    #[test]
    fn rejects_crit_above_warn() {
        env::set_var("ACCURACY_WARN", "0.5");
        env::set_var("ACCURACY_CRIT", "0.9");
        let result = Config::from_env();
        env::remove_var("ACCURACY_WARN");
        env::remove_var("ACCURACY_CRIT");
        assert!(matches!(result, Err(OracleError::ConfigError(_))));
    }

    #[test]
    fn defaults_are_sane() {
        env::remove_var("WHALE_THRESHOLD_BTC");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.whale_threshold_btc, 100.0);
        assert_eq!(cfg.ws_port, 8765);
        assert_eq!(cfg.http_port, 8001);
    }
}
