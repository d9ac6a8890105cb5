//! Read-only HTTP API (§6): health aggregation plus dashboard
//! projections over the Correlation Tracker's store and the in-memory
//! alert/price state. Router assembly follows the teacher's
//! `main.rs` (`Router::new().route(...)`, `CorsLayer`, request-logging
//! middleware).

use crate::adapters::AdapterState;
use crate::models::{Direction, FlowType, PriceEstimate, UrgencyLevel, WhaleAlert};
use crate::orchestrator::PipelineHandles;
use crate::tracker::PredictionStore;
use arc_swap::ArcSwap;
use axum::extract::{FromRef, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<PredictionStore>,
    pub adapter_states: Arc<HashMap<&'static str, tokio::sync::watch::Receiver<AdapterState>>>,
    pub started_at: Instant,
    pub latest_price: Arc<ArcSwap<Option<PriceEstimate>>>,
    pub alert_history: Arc<Mutex<VecDeque<WhaleAlert>>>,
}

/// Lets axum extract `State<ApiState>` from a router whose shared
/// state is the whole pipeline handle bundle.
impl FromRef<Arc<PipelineHandles>> for ApiState {
    fn from_ref(handles: &Arc<PipelineHandles>) -> Self {
        handles.api_state()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub components: Vec<ComponentHealth>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: &'static str,
    pub latency_ms: u64,
    pub error: Option<String>,
}

pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let mut components = Vec::new();
    let mut any_unhealthy = false;
    let mut any_degraded = false;

    for (name, rx) in state.adapter_states.iter() {
        let adapter_state = *rx.borrow();
        let status = match adapter_state {
            AdapterState::Connected => "healthy",
            AdapterState::Reconnecting | AdapterState::Disconnected => {
                any_degraded = true;
                "degraded"
            }
            AdapterState::Failed => {
                any_unhealthy = true;
                "unhealthy"
            }
        };
        components.push(ComponentHealth {
            name,
            status,
            latency_ms: 0,
            error: None,
        });
    }

    let store_start = Instant::now();
    let store_ok = state.store.reachable();
    let store_latency = store_start.elapsed().as_millis() as u64;
    if !store_ok {
        any_unhealthy = true;
    }
    components.push(ComponentHealth {
        name: "correlation_store",
        status: if store_ok { "healthy" } else { "unhealthy" },
        latency_ms: store_latency,
        error: if store_ok { None } else { Some("store unreachable".into()) },
    });

    let status = if any_unhealthy {
        "unhealthy"
    } else if any_degraded {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status,
        components,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

pub async fn prices_latest(State(state): State<ApiState>) -> impl IntoResponse {
    match &*state.latest_price.load_full() {
        Some(estimate) => Json(Some(estimate.clone())).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, Json(None::<PriceEstimate>)).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalQuery {
    days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DailyAggregate {
    pub date: String,
    pub utxoracle_price: f64,
    pub confidence: f64,
    pub is_valid: bool,
}

pub async fn prices_historical(
    State(state): State<ApiState>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<Vec<DailyAggregate>>, StatusCode> {
    let days = query.days.unwrap_or(30);
    if days == 0 || days > 3650 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut out = Vec::new();
    let today = chrono::Utc::now().date_naive();
    for offset in 0..days {
        let date = today - chrono::Duration::days(offset as i64);
        let key = date.format("%Y-%m-%d").to_string();
        match state.store.get_price_analysis(&key) {
            Ok(Some((price, confidence, is_valid))) => out.push(DailyAggregate {
                date: key,
                utxoracle_price: price,
                confidence,
                is_valid,
            }),
            Ok(None) => {}
            Err(_) => return Err(StatusCode::SERVICE_UNAVAILABLE),
        }
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhaleQuery {
    hours: Option<u32>,
    min_btc: Option<f64>,
    flow_type: Option<String>,
    rbf_only: Option<bool>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct WhaleRecord {
    pub correlation_id: String,
    pub txid: String,
    pub btc_value: f64,
    pub direction: Direction,
    pub flow_type: FlowType,
    pub urgency_score: f64,
    pub urgency_level: UrgencyLevel,
    pub predicted_confirm_block: u64,
    pub rbf_enabled: bool,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl From<&WhaleAlert> for WhaleRecord {
    fn from(a: &WhaleAlert) -> Self {
        WhaleRecord {
            correlation_id: a.correlation_id.clone(),
            txid: a.candidate.txid.to_string(),
            btc_value: a.candidate.btc_value,
            direction: a.candidate.direction,
            flow_type: a.candidate.flow_type,
            urgency_score: a.urgency_score,
            urgency_level: a.urgency_level,
            predicted_confirm_block: a.predicted_confirm_block,
            rbf_enabled: a.rbf_enabled,
            detected_at: a.candidate.detected_at,
        }
    }
}

fn flow_type_matches(flow_type: FlowType, wanted: &str) -> bool {
    let name = match flow_type {
        FlowType::ExchangeInflow => "exchange_inflow",
        FlowType::ExchangeOutflow => "exchange_outflow",
        FlowType::WhaleTransfer => "whale_transfer",
        FlowType::Unknown => "unknown",
    };
    name.eq_ignore_ascii_case(wanted)
}

/// Applies the §6 query filters over the in-memory alert history. The
/// durable `predictions` table doesn't carry btc_value/direction/
/// flow_type, so filtering reads from this ring buffer rather than the
/// Correlation Tracker's store (§9).
fn filter_alerts<'a>(
    alerts: impl Iterator<Item = &'a WhaleAlert>,
    since: chrono::DateTime<chrono::Utc>,
    min_btc: Option<f64>,
    flow_type: Option<&str>,
    rbf_only: bool,
) -> Vec<&'a WhaleAlert> {
    alerts
        .filter(|a| a.candidate.detected_at >= since)
        .filter(|a| min_btc.map_or(true, |min| a.candidate.btc_value >= min))
        .filter(|a| flow_type.map_or(true, |ft| flow_type_matches(a.candidate.flow_type, ft)))
        .filter(|a| !rbf_only || a.rbf_enabled)
        .collect()
}

pub async fn whale_transactions(
    State(state): State<ApiState>,
    Query(query): Query<WhaleQuery>,
) -> Result<Json<Vec<WhaleRecord>>, StatusCode> {
    let limit = query.limit.unwrap_or(100);
    if !(1..=1000).contains(&limit) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let hours = query.hours.unwrap_or(24);
    let since = chrono::Utc::now() - chrono::Duration::hours(hours as i64);

    let history = state.alert_history.lock();
    let mut matched = filter_alerts(
        history.iter(),
        since,
        query.min_btc,
        query.flow_type.as_deref(),
        query.rbf_only.unwrap_or(false),
    );
    matched.sort_by(|a, b| b.candidate.detected_at.cmp(&a.candidate.detected_at));
    let records = matched
        .into_iter()
        .take(limit as usize)
        .map(WhaleRecord::from)
        .collect();

    Ok(Json(records))
}

pub async fn whale_transaction(
    State(state): State<ApiState>,
    axum::extract::Path(txid): axum::extract::Path<String>,
) -> impl IntoResponse {
    let history = state.alert_history.lock();
    match history.iter().find(|a| a.candidate.txid.to_string() == txid) {
        Some(alert) => (StatusCode::OK, Json(Some(WhaleRecord::from(alert)))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct WhaleSummary {
    pub count: usize,
    pub total_btc: f64,
    #[serde(rename = "exchangeInflowCount")]
    pub exchange_inflow_count: usize,
    #[serde(rename = "exchangeOutflowCount")]
    pub exchange_outflow_count: usize,
}

pub async fn whale_summary(
    State(state): State<ApiState>,
    Query(query): Query<WhaleQuery>,
) -> Result<Json<WhaleSummary>, StatusCode> {
    let hours = query.hours.unwrap_or(24);
    let since = chrono::Utc::now() - chrono::Duration::hours(hours as i64);

    let history = state.alert_history.lock();
    let matched = filter_alerts(
        history.iter(),
        since,
        query.min_btc,
        query.flow_type.as_deref(),
        query.rbf_only.unwrap_or(false),
    );

    let total_btc = matched.iter().map(|a| a.candidate.btc_value).sum();
    let exchange_inflow_count = matched
        .iter()
        .filter(|a| a.candidate.flow_type == FlowType::ExchangeInflow)
        .count();
    let exchange_outflow_count = matched
        .iter()
        .filter(|a| a.candidate.flow_type == FlowType::ExchangeOutflow)
        .count();

    Ok(Json(WhaleSummary {
        count: matched.len(),
        total_btc,
        exchange_inflow_count,
        exchange_outflow_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, FlowType, WhaleCandidate};
    use crate::tracker::PredictionStore;

    fn state() -> ApiState {
        ApiState {
            store: Arc::new(PredictionStore::open_in_memory().unwrap()),
            adapter_states: Arc::new(HashMap::new()),
            started_at: Instant::now(),
            latest_price: Arc::new(ArcSwap::from_pointee(None)),
            alert_history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn alert(byte: u8, btc_value: f64, flow_type: FlowType, rbf_enabled: bool) -> WhaleAlert {
        use bitcoin::hashes::Hash;
        WhaleAlert {
            candidate: WhaleCandidate {
                txid: bitcoin::Txid::from_byte_array([byte; 32]),
                btc_value,
                direction: Direction::In,
                flow_type,
                detected_at: chrono::Utc::now(),
            },
            urgency_score: 0.5,
            urgency_level: UrgencyLevel::Medium,
            predicted_confirm_block: 800_100,
            rbf_enabled,
            correlation_id: format!("corr-{byte}"),
        }
    }

    #[tokio::test]
    async fn historical_rejects_zero_days() {
        let result = prices_historical(State(state()), Query(HistoricalQuery { days: Some(0) })).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn whale_transactions_rejects_out_of_range_limit() {
        let result = whale_transactions(
            State(state()),
            Query(WhaleQuery {
                hours: None,
                min_btc: None,
                flow_type: None,
                rbf_only: None,
                limit: Some(5000),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn prices_latest_reports_unavailable_before_first_tick() {
        let response = prices_latest(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn whale_transactions_applies_min_btc_filter() {
        let s = state();
        {
            let mut history = s.alert_history.lock();
            history.push_back(alert(1, 50.0, FlowType::WhaleTransfer, false));
            history.push_back(alert(2, 500.0, FlowType::ExchangeInflow, true));
        }

        let result = whale_transactions(
            State(s),
            Query(WhaleQuery {
                hours: None,
                min_btc: Some(100.0),
                flow_type: None,
                rbf_only: None,
                limit: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(result.0.len(), 1);
        assert_eq!(result.0[0].correlation_id, "corr-2");
    }

    #[tokio::test]
    async fn whale_transaction_by_txid_matches_history() {
        let s = state();
        let a = alert(3, 120.0, FlowType::WhaleTransfer, false);
        let txid = a.candidate.txid.to_string();
        s.alert_history.lock().push_back(a);

        let response = whale_transaction(State(s), axum::extract::Path(txid)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn whale_summary_sums_btc_value_over_window() {
        let s = state();
        {
            let mut history = s.alert_history.lock();
            history.push_back(alert(4, 100.0, FlowType::ExchangeInflow, false));
            history.push_back(alert(5, 200.0, FlowType::ExchangeOutflow, false));
        }

        let result = whale_summary(
            State(s),
            Query(WhaleQuery {
                hours: None,
                min_btc: None,
                flow_type: None,
                rbf_only: None,
                limit: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(result.0.count, 2);
        assert_eq!(result.0.total_btc, 300.0);
        assert_eq!(result.0.exchange_inflow_count, 1);
        assert_eq!(result.0.exchange_outflow_count, 1);
    }
}
