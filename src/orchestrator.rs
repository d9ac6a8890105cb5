//! Orchestrator (§2, §5): owns component lifecycles, wires the
//! adapters into the Cache/Classifier/Urgency/Aggregator/Broadcaster/
//! Tracker pipeline via typed channels, and supervises the memory
//! watchdog and graceful shutdown. This is the single place that
//! understands the whole dataflow graph described in spec.md §2.

use crate::adapters::fee_market::FeeMarketAdapter;
use crate::adapters::rawblock::RawBlockAdapter;
use crate::adapters::rawtx::RawTxAdapter;
use crate::adapters::rpc::{resolve_credentials, RpcAdapter};
use crate::adapters::AdapterState;
use crate::aggregator::{AggregatorConfig, PriceAggregator};
use crate::api::ApiState;
use crate::broadcaster::{AuthVerifier, Broadcaster};
use crate::cache::TransactionCache;
use crate::classifier::{classify, AddressBook, ClassificationConfig};
use crate::config::Config;
use crate::error::OracleError;
use crate::models::{ParsedTransaction, PredictionRecord, PredictionStatus, PriceEstimate, WhaleAlert, WsServerEvent};
use crate::resolution::{AccuracyMonitor, Resolver, ResolverConfig};
use crate::tracker::PredictionStore;
use crate::urgency::UrgencyScorer;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Bound on the in-memory "recent alerts" ring buffer backing the
/// whale-query HTTP endpoints (§6). Durable history lives in the
/// Correlation Tracker's SQLite store; this buffer only exists to
/// answer dashboard queries (filter by hours/min_btc/flow_type/rbf)
/// against data the durable schema doesn't carry (§9).
const ALERT_HISTORY_CAPACITY: usize = 10_000;

/// Shared, long-lived handles the Orchestrator wires together and
/// that the HTTP/WS routers need to serve requests.
pub struct PipelineHandles {
    pub cache: Arc<Mutex<TransactionCache>>,
    pub urgency: Arc<UrgencyScorer>,
    pub store: Arc<PredictionStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub auth: Arc<AuthVerifier>,
    pub auth_enabled: bool,
    pub auth_timeout: Duration,
    pub adapter_states: Arc<HashMap<&'static str, watch::Receiver<AdapterState>>>,
    pub aggregator_cmd: mpsc::Sender<AggregatorCommand>,
    pub cancel: watch::Sender<bool>,
    pub started_at: Instant,
    pub latest_price: Arc<ArcSwap<Option<PriceEstimate>>>,
    pub alert_history: Arc<Mutex<VecDeque<WhaleAlert>>>,
}

pub enum AggregatorCommand {
    RecordOutput(u64),
}

impl PipelineHandles {
    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            adapter_states: self.adapter_states.clone(),
            started_at: self.started_at,
            latest_price: self.latest_price.clone(),
            alert_history: self.alert_history.clone(),
        }
    }
}

/// Builds and spawns the full pipeline. Returns the shared handles the
/// HTTP/WS layer (wired in `main.rs`) needs; the spawned tasks run
/// until `cancel` is set to `true`.
pub async fn spawn_pipeline(config: Arc<Config>) -> Result<PipelineHandles, OracleError> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let cache = Arc::new(Mutex::new(TransactionCache::new(config.cache_max_size)));
    let address_book = Arc::new(AddressBook::default());
    let classification_config = ClassificationConfig {
        whale_threshold_btc: config.whale_threshold_btc,
    };
    let urgency = Arc::new(UrgencyScorer::new(config.stale_snapshot_max_age));
    let store = Arc::new(PredictionStore::open(&config.whale_db_path)?);
    let broadcaster = Broadcaster::with_rate_limit(config.subscriber_queue_size, config.subscriber_rate_limit_per_sec);
    let auth = Arc::new(AuthVerifier::new(config.auth_secret_key.clone()));
    let latest_price = Arc::new(ArcSwap::from_pointee(None));
    let alert_history = Arc::new(Mutex::new(VecDeque::with_capacity(ALERT_HISTORY_CAPACITY)));

    let rpc = match resolve_credentials(&config) {
        Ok(creds) => match RpcAdapter::connect(creds, Duration::from_secs(10)) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(component = "orchestrator", error = %e, "RPC adapter unavailable, REPLACED detection disabled");
                None
            }
        },
        Err(e) => {
            warn!(component = "orchestrator", error = %e, "no RPC credentials configured");
            None
        }
    };

    let tip_height = if let Some(rpc) = &rpc {
        rpc.tip_height().await.unwrap_or(0)
    } else {
        0
    };

    // --- Upstream adapters ---
    let rawtx_adapter = RawTxAdapter::new(config.zmq_rawtx_endpoint.clone(), config.circuit_breaker_threshold);
    let rawtx_rx = rawtx_adapter.start(cancel_rx.clone());
    let rawtx_state = rawtx_adapter.state_watch();

    let rawblock_adapter = RawBlockAdapter::new(config.zmq_rawblock_endpoint.clone(), config.circuit_breaker_threshold);
    let rawblock_rx = rawblock_adapter.start(cancel_rx.clone(), tip_height);
    let rawblock_state = rawblock_adapter.state_watch();

    let fee_market_state = if let Some(url) = config.fee_market_url.clone() {
        let fee_adapter = FeeMarketAdapter::new(url, Duration::from_secs(60), config.circuit_breaker_threshold);
        let mut fee_rx = fee_adapter.start(cancel_rx.clone());
        let urgency_for_fees = urgency.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = fee_rx.recv().await {
                urgency_for_fees.publish(snapshot);
            }
        });
        Some(fee_adapter.state_watch())
    } else {
        warn!(component = "orchestrator", "FEE_MARKET_URL not set, urgency scoring disabled");
        None
    };

    // --- Price Aggregator: single owning task, driven by commands ---
    let (agg_cmd_tx, mut agg_cmd_rx) = mpsc::channel::<AggregatorCommand>(16_384);
    let aggregator_broadcaster = broadcaster.clone();
    let tick_interval = Duration::from_millis(config.price_tick_interval_ms);
    let aggregator_config = AggregatorConfig {
        window_max_age: Duration::from_secs(config.rolling_window_hours * 3600),
        min_samples: config.min_samples,
        min_emit_confidence: config.min_emit_confidence,
        emit_delta_rel: config.emit_delta_rel,
        max_search_iterations: config.max_search_iterations,
        max_step_rel: config.max_step_rel,
        ..AggregatorConfig::default()
    };
    let mut agg_cancel = cancel_rx.clone();
    let aggregator_latest_price = latest_price.clone();
    tokio::spawn(async move {
        let mut aggregator = PriceAggregator::new(aggregator_config);
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = agg_cancel.changed() => {
                    if *agg_cancel.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(estimate) = aggregator.tick(chrono::Utc::now()) {
                        aggregator_latest_price.store(Arc::new(Some(estimate.clone())));
                        aggregator_broadcaster.broadcast(WsServerEvent::from(&estimate));
                    }
                }
                cmd = agg_cmd_rx.recv() => {
                    match cmd {
                        Some(AggregatorCommand::RecordOutput(sats)) => aggregator.record_output(sats),
                        None => return,
                    }
                }
            }
        }
    });

    // --- Correlation Tracker: resolver + accuracy monitor + retention ---
    let resolver = Arc::new(Resolver::new(
        store.clone(),
        cache.clone(),
        rpc.clone(),
        ResolverConfig {
            drop_timeout: config.drop_timeout,
            poll_interval: Duration::from_secs(60),
        },
    ));
    {
        let resolver = resolver.clone();
        let cancel_rx = cancel_rx.clone();
        tokio::spawn(async move { resolver.run_drop_sweep(cancel_rx).await });
    }
    {
        let resolver = resolver.clone();
        let cancel_rx = cancel_rx.clone();
        let retention_days = config.retention_days;
        tokio::spawn(async move { resolver.run_retention_cleanup(retention_days, cancel_rx).await });
    }
    {
        let monitor = Arc::new(AccuracyMonitor::new(store.clone(), config.accuracy_warn, config.accuracy_crit));
        let cancel_rx = cancel_rx.clone();
        tokio::spawn(async move { monitor.run(cancel_rx).await });
    }

    // --- Memory watchdog (§5, SPEC_FULL.md supplemented feature 3) ---
    {
        let cache = cache.clone();
        let soft_limit = config.soft_mem_limit_mb;
        let hard_limit = config.hard_mem_limit_mb;
        let mut cancel_rx = cancel_rx.clone();
        tokio::spawn(async move {
            run_memory_watchdog(cache, soft_limit, hard_limit, &mut cancel_rx).await;
        });
    }

    // --- Dispatcher: transactions -> Cache -> Classifier + Aggregator;
    //     whale matches -> Urgency Scorer -> Tracker + Broadcaster;
    //     blocks -> Tracker + Cache eviction. ---
    {
        let cache = cache.clone();
        let urgency = urgency.clone();
        let store = store.clone();
        let broadcaster = broadcaster.clone();
        let agg_cmd_tx = agg_cmd_tx.clone();
        let address_book = address_book.clone();
        let alert_history = alert_history.clone();
        let mut rawtx_rx = rawtx_rx;
        let mut cancel_rx = cancel_rx.clone();
        let malformed_counter = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    event = rawtx_rx.recv() => {
                        let Some(event) = event else { return };
                        handle_transaction(
                            event.tx,
                            &cache,
                            &urgency,
                            &store,
                            &broadcaster,
                            &agg_cmd_tx,
                            &address_book,
                            &classification_config,
                            &malformed_counter,
                            &alert_history,
                        )
                        .await;
                    }
                }
            }
        });
    }

    {
        let cache = cache.clone();
        let resolver = resolver.clone();
        let mut rawblock_rx = rawblock_rx;
        let mut cancel_rx = cancel_rx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    event = rawblock_rx.recv() => {
                        let Some(event) = event else { return };
                        resolver.resolve_block(event.height, &event.txids).await;
                        let mut cache = cache.lock();
                        for txid in &event.txids {
                            cache.remove(txid);
                        }
                        info!(component = "orchestrator", height = event.height, txs = event.txids.len(), "block processed");
                    }
                }
            }
        });
    }

    let mut adapter_states: HashMap<&'static str, watch::Receiver<AdapterState>> = HashMap::new();
    adapter_states.insert("rawtx_adapter", rawtx_state);
    adapter_states.insert("rawblock_adapter", rawblock_state);
    if let Some(state) = fee_market_state {
        adapter_states.insert("fee_market_adapter", state);
    }

    Ok(PipelineHandles {
        cache,
        urgency,
        store,
        broadcaster,
        auth,
        auth_enabled: config.auth_enabled,
        auth_timeout: config.auth_timeout,
        adapter_states: Arc::new(adapter_states),
        aggregator_cmd: agg_cmd_tx,
        cancel: cancel_tx,
        started_at: Instant::now(),
        latest_price,
        alert_history,
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_transaction(
    tx: ParsedTransaction,
    cache: &Arc<Mutex<TransactionCache>>,
    urgency: &Arc<UrgencyScorer>,
    store: &Arc<PredictionStore>,
    broadcaster: &Arc<Broadcaster>,
    agg_cmd_tx: &mpsc::Sender<AggregatorCommand>,
    address_book: &Arc<AddressBook>,
    classification_config: &ClassificationConfig,
    malformed_counter: &Arc<AtomicU64>,
    alert_history: &Arc<Mutex<VecDeque<WhaleAlert>>>,
) {
    let total_output_sats = tx.total_output_sats;
    let fee_rate = tx.fee_rate();
    let rbf_enabled = tx.rbf_enabled;

    let evicted = {
        let mut cache = cache.lock();
        cache.insert(tx.clone())
    };
    if let Some(evicted) = evicted {
        warn!(component = "cache", txid = %evicted.txid, "evicted at capacity");
    }

    // Unlike the Broadcaster's per-subscriber enqueue, this send is
    // allowed to yield under backpressure (§5) rather than drop.
    if agg_cmd_tx
        .send(AggregatorCommand::RecordOutput(total_output_sats))
        .await
        .is_err()
    {
        warn!(component = "aggregator", "command channel closed, dropping output");
    }

    let now = chrono::Utc::now();
    let candidate = match classify(&tx, address_book, classification_config, now) {
        Some(c) => c,
        None => return,
    };

    let urgency_score = urgency.score(fee_rate);
    let (urgency_value, urgency_level, predicted_confirm_block) = match urgency_score {
        Some(score) => (score.urgency_score, score.urgency_level, score.predicted_confirm_block),
        None => {
            malformed_counter.fetch_add(1, Ordering::Relaxed);
            (0.5, crate::models::UrgencyLevel::Medium, 0)
        }
    };

    let correlation_id = Uuid::new_v4().to_string();
    let record = PredictionRecord {
        correlation_id: correlation_id.clone(),
        txid: candidate.txid,
        created_at: now,
        predicted_confirm_block,
        urgency_score: urgency_value,
        rbf_enabled,
        status: PredictionStatus::Pending,
        resolved_at: None,
        actual_confirm_block: None,
        accuracy: None,
    };

    // Durability before broadcast (§3, §8 invariant 3): persist first.
    if let Err(e) = store.insert(&record) {
        error!(component = "correlation_tracker", error = %e, "failed to persist prediction, alert suppressed");
        return;
    }

    let alert = WhaleAlert {
        candidate,
        urgency_score: urgency_value,
        urgency_level,
        predicted_confirm_block,
        rbf_enabled,
        correlation_id,
    };

    {
        let mut history = alert_history.lock();
        if history.len() >= ALERT_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(alert.clone());
    }

    broadcaster.broadcast(WsServerEvent::from(&alert));
}

async fn run_memory_watchdog(
    cache: Arc<Mutex<TransactionCache>>,
    soft_limit_mb: u64,
    hard_limit_mb: u64,
    cancel: &mut watch::Receiver<bool>,
) {
    let mut system = sysinfo::System::new_all();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    let mut downscaled = false;

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                system.refresh_all();
                let Some(process) = system.process(pid) else { continue };
                let rss_mb = process.memory() / 1024 / 1024;

                if rss_mb >= hard_limit_mb {
                    error!(component = "memory_watchdog", rss_mb, hard_limit_mb, "CRITICAL: hard memory limit breached");
                    // The Orchestrator triggers a graceful restart; in this process
                    // model that means a clean, logged exit for the supervisor to restart.
                    std::process::exit(1);
                } else if rss_mb >= soft_limit_mb {
                    if !downscaled {
                        let mut cache = cache.lock();
                        let new_size = (cache.len() / 2).max(1);
                        warn!(component = "memory_watchdog", rss_mb, soft_limit_mb, new_size, "soft limit breached, downscaling cache");
                        cache.shrink_to(new_size);
                        downscaled = true;
                    }
                } else {
                    downscaled = false;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PipelineStats {
    pub cache_size: usize,
    pub subscriber_count: usize,
}

impl PipelineHandles {
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            cache_size: self.cache.lock().len(),
            subscriber_count: self.broadcaster.subscriber_count(),
        }
    }
}
