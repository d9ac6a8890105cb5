//! Bitcoin node RPC adapter (§4.1, §6): request/response JSON-RPC over
//! HTTP, used by the Correlation Tracker's historical lookups and the
//! Classifier's input-address resolution. Credentials resolve in
//! order: explicit config, cookie file, `bitcoin.conf`-style
//! user/password file (§6).

use crate::config::Config;
use crate::error::OracleError;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use std::path::Path;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct RpcCredentials {
    pub url: String,
    pub auth: ResolvedAuth,
}

#[derive(Debug, Clone)]
pub enum ResolvedAuth {
    UserPass(String, String),
    CookieFile(String),
    None,
}

impl Default for ResolvedAuth {
    fn default() -> Self {
        ResolvedAuth::None
    }
}

/// Resolves credentials per §6's order: explicit config, then a
/// cookie file under the data directory, then a `bitcoin.conf`-style
/// user/password file.
pub fn resolve_credentials(config: &Config) -> Result<RpcCredentials, OracleError> {
    let url = config
        .rpc_url
        .clone()
        .ok_or_else(|| OracleError::ConfigError("BITCOIN_RPC_URL not set".into()))?;

    if let (Some(user), Some(pass)) = (&config.rpc_user, &config.rpc_password) {
        return Ok(RpcCredentials {
            url,
            auth: ResolvedAuth::UserPass(user.clone(), pass.clone()),
        });
    }

    if let Some(cookie_path) = &config.rpc_cookie_path {
        if Path::new(cookie_path).exists() {
            return Ok(RpcCredentials {
                url,
                auth: ResolvedAuth::CookieFile(cookie_path.clone()),
            });
        }
        warn!(
            component = "rpc_adapter",
            path = %cookie_path,
            "configured cookie file not found, falling back to bitcoin.conf"
        );
    }

    if let Some(conf_path) = &config.rpc_conf_path {
        match parse_bitcoin_conf(conf_path) {
            Ok(Some((user, pass))) => {
                return Ok(RpcCredentials {
                    url,
                    auth: ResolvedAuth::UserPass(user, pass),
                });
            }
            Ok(None) => warn!(
                component = "rpc_adapter",
                path = %conf_path,
                "bitcoin.conf has no rpcuser/rpcpassword pair, falling back to no auth"
            ),
            Err(e) => warn!(
                component = "rpc_adapter",
                path = %conf_path,
                error = %e,
                "failed to read bitcoin.conf, falling back to no auth"
            ),
        }
    }

    Ok(RpcCredentials {
        url,
        auth: ResolvedAuth::None,
    })
}

/// Parses `rpcuser=`/`rpcpassword=` lines out of a `bitcoin.conf`-style
/// file (§6's third credential-resolution step). Returns `Ok(None)`
/// when the file exists but lacks either key.
fn parse_bitcoin_conf(path: &str) -> std::io::Result<Option<(String, String)>> {
    let contents = std::fs::read_to_string(path)?;
    let mut user = None;
    let mut pass = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("rpcuser=") {
            user = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("rpcpassword=") {
            pass = Some(value.trim().to_string());
        }
    }
    Ok(user.zip(pass))
}

/// Wraps `bitcoincore_rpc::Client`, whose calls are blocking, inside a
/// `spawn_blocking` boundary so the async Orchestrator never stalls on
/// node I/O (§5 "all I/O ... is asynchronous/blocking and yields").
pub struct RpcAdapter {
    client: std::sync::Arc<Client>,
    call_timeout: Duration,
}

impl RpcAdapter {
    pub fn connect(creds: RpcCredentials, call_timeout: Duration) -> Result<Self, OracleError> {
        let auth = match creds.auth {
            ResolvedAuth::UserPass(u, p) => Auth::UserPass(u, p),
            ResolvedAuth::CookieFile(path) => Auth::CookieFile(path.into()),
            ResolvedAuth::None => Auth::None,
        };
        let client = Client::new(&creds.url, auth)
            .map_err(|e| OracleError::SourceUnavailable(e.to_string()))?;
        Ok(Self {
            client: std::sync::Arc::new(client),
            call_timeout,
        })
    }

    pub async fn tip_height(&self) -> Result<u64, OracleError> {
        let client = self.client.clone();
        let timeout = self.call_timeout;
        tokio::time::timeout(timeout, spawn_blocking(move || client.get_block_count()))
            .await
            .map_err(|_| OracleError::SourceUnavailable("rpc call timed out".into()))?
            .map_err(|e| OracleError::SourceUnavailable(e.to_string()))?
            .map_err(OracleError::from)
    }

    pub async fn get_transaction(
        &self,
        txid: bitcoin::Txid,
    ) -> Result<Option<bitcoin::Transaction>, OracleError> {
        let client = self.client.clone();
        let timeout = self.call_timeout;
        let result = tokio::time::timeout(
            timeout,
            spawn_blocking(move || client.get_raw_transaction(&txid, None)),
        )
        .await
        .map_err(|_| OracleError::SourceUnavailable("rpc call timed out".into()))?
        .map_err(|e| OracleError::SourceUnavailable(e.to_string()))?;

        match result {
            Ok(tx) => Ok(Some(tx)),
            Err(bitcoincore_rpc::Error::JsonRpc(
                bitcoincore_rpc::jsonrpc::Error::Rpc(ref e),
            )) if e.code == -5 => Ok(None), // "No such transaction"
            Err(e) => Err(OracleError::from(e)),
        }
    }

    pub async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<bitcoin::Block>, OracleError> {
        let client = self.client.clone();
        let timeout = self.call_timeout;
        let result = tokio::time::timeout(timeout, spawn_blocking(move || {
            let hash = client.get_block_hash(height)?;
            client.get_block(&hash)
        }))
        .await
        .map_err(|_| OracleError::SourceUnavailable("rpc call timed out".into()))?
        .map_err(|e| OracleError::SourceUnavailable(e.to_string()))?;

        match result {
            Ok(block) => Ok(Some(block)),
            Err(bitcoincore_rpc::Error::JsonRpc(
                bitcoincore_rpc::jsonrpc::Error::Rpc(ref e),
            )) if e.code == -8 => Ok(None), // height out of range
            Err(e) => Err(OracleError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            whale_threshold_btc: 100.0,
            whale_db_path: ":memory:".into(),
            price_tick_interval_ms: 500,
            rolling_window_hours: 3,
            min_samples: 1000,
            min_emit_confidence: 0.8,
            emit_delta_rel: 0.002,
            max_search_iterations: 6,
            max_step_rel: 0.05,
            auth_enabled: true,
            auth_secret_key: "x".repeat(32),
            auth_timeout: Duration::from_secs(5),
            ws_host: "127.0.0.1".into(),
            ws_port: 8765,
            http_port: 8001,
            retention_days: 90,
            soft_mem_limit_mb: 400,
            hard_mem_limit_mb: 800,
            accuracy_warn: 0.75,
            accuracy_crit: 0.70,
            stale_snapshot_max_age: Duration::from_secs(600),
            drop_timeout: Duration::from_secs(7200),
            cache_max_size: 1000,
            subscriber_queue_size: 256,
            subscriber_rate_limit_per_sec: 50,
            circuit_breaker_threshold: 10,
            rpc_url: Some("http://127.0.0.1:8332".into()),
            rpc_cookie_path: None,
            rpc_user: None,
            rpc_password: None,
            rpc_conf_path: None,
            zmq_rawtx_endpoint: "tcp://127.0.0.1:28332".into(),
            zmq_rawblock_endpoint: "tcp://127.0.0.1:28333".into(),
            fee_market_url: None,
        }
    }

    #[test]
    fn prefers_explicit_userpass_over_cookie() {
        let mut config = base_config();
        config.rpc_user = Some("u".into());
        config.rpc_password = Some("p".into());
        config.rpc_cookie_path = Some("/nonexistent/.cookie".into());
        let creds = resolve_credentials(&config).unwrap();
        assert!(matches!(creds.auth, ResolvedAuth::UserPass(_, _)));
    }

    #[test]
    fn falls_back_to_none_when_cookie_missing() {
        let mut config = base_config();
        config.rpc_cookie_path = Some("/nonexistent/.cookie".into());
        let creds = resolve_credentials(&config).unwrap();
        assert!(matches!(creds.auth, ResolvedAuth::None));
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let mut config = base_config();
        config.rpc_url = None;
        assert!(resolve_credentials(&config).is_err());
    }

    #[test]
    fn falls_back_to_bitcoin_conf_when_no_cookie() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\nrpcuser=confuser\nrpcpassword=confpass").unwrap();

        let mut config = base_config();
        config.rpc_conf_path = Some(file.path().to_string_lossy().to_string());
        let creds = resolve_credentials(&config).unwrap();
        match creds.auth {
            ResolvedAuth::UserPass(user, pass) => {
                assert_eq!(user, "confuser");
                assert_eq!(pass, "confpass");
            }
            other => panic!("expected UserPass from bitcoin.conf, got {other:?}"),
        }
    }

    #[test]
    fn bitcoin_conf_missing_password_falls_back_to_none() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rpcuser=onlyuser").unwrap();

        let mut config = base_config();
        config.rpc_conf_path = Some(file.path().to_string_lossy().to_string());
        let creds = resolve_credentials(&config).unwrap();
        assert!(matches!(creds.auth, ResolvedAuth::None));
    }
}
