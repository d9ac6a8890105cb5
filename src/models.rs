//! Domain model shared across the pipeline (§3).
//!
//! `ParsedTransaction` is immutable once stored; the Cache is its sole
//! owner. Every other component receives read-only views bounded by
//! the lifetime of the current pipeline step — a consumer that must
//! outlive the Cache entry copies what it needs (the Correlation
//! Tracker copies `txid` and metadata into its own store).

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Hex-printable 32-byte transaction id.
pub type Txid = bitcoin::Txid;

#[derive(Debug, Clone)]
pub struct ParsedTransaction {
    pub txid: Txid,
    /// Monotonic timestamp assigned at cache insertion.
    pub first_seen_at: Instant,
    pub total_output_sats: u64,
    pub fee_sats: u64,
    pub vsize_vbytes: u64,
    pub rbf_enabled: bool,
    pub input_addresses: Option<Vec<String>>,
    pub output_addresses: Option<Vec<String>>,
}

impl ParsedTransaction {
    /// Fee rate in sat/vB; zero vsize (malformed) yields zero rather than NaN.
    pub fn fee_rate(&self) -> f64 {
        if self.vsize_vbytes == 0 {
            0.0
        } else {
            self.fee_sats as f64 / self.vsize_vbytes as f64
        }
    }

    pub fn btc_value(&self) -> f64 {
        self.total_output_sats as f64 / 100_000_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    In,
    Out,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    ExchangeInflow,
    ExchangeOutflow,
    WhaleTransfer,
    Unknown,
}

/// Produced by the Whale Classifier. References the owning
/// `ParsedTransaction` by txid only; the Cache remains the owner.
#[derive(Debug, Clone)]
pub struct WhaleCandidate {
    pub txid: Txid,
    pub btc_value: f64,
    pub direction: Direction,
    pub flow_type: FlowType,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
}

/// A `WhaleCandidate` enriched by the Urgency Scorer. Every broadcast
/// alert has a durable `PredictionRecord` before it is enqueued for
/// fan-out (§3 invariant).
#[derive(Debug, Clone)]
pub struct WhaleAlert {
    pub candidate: WhaleCandidate,
    pub urgency_score: f64,
    pub urgency_level: UrgencyLevel,
    pub predicted_confirm_block: u64,
    pub rbf_enabled: bool,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEstimate {
    pub tick_id: u64,
    pub wall_time: chrono::DateTime<chrono::Utc>,
    pub price_usd: f64,
    pub confidence: f64,
    pub sample_size: usize,
    pub histogram_digest: String,
}

/// Percentiles p10..p90 of mempool sat/vB, refreshed by the Urgency
/// Scorer. Consumers read the latest pointer via an atomic swap
/// (§9 "Global mutable state").
#[derive(Debug, Clone)]
pub struct FeeSnapshot {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub mempool_bytes: u64,
    pub tip_height: u64,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl FeeSnapshot {
    pub fn age(&self) -> chrono::Duration {
        chrono::Utc::now() - self.captured_at
    }

    /// Linear interpolation of `fee_rate` against the snapshot's
    /// percentile ticks, clamped to [0, 100].
    pub fn percentile_of(&self, fee_rate: f64) -> f64 {
        let points = [
            (0.0, 0.0),
            (10.0, self.p10),
            (25.0, self.p25),
            (50.0, self.p50),
            (75.0, self.p75),
            (90.0, self.p90),
            (100.0, self.p90 * 1.5 + 1.0),
        ];

        if fee_rate <= points[0].1 {
            return 0.0;
        }
        for window in points.windows(2) {
            let (p_lo, v_lo) = window[0];
            let (p_hi, v_hi) = window[1];
            if fee_rate <= v_hi {
                if (v_hi - v_lo).abs() < f64::EPSILON {
                    return p_hi;
                }
                let t = (fee_rate - v_lo) / (v_hi - v_lo);
                return p_lo + t * (p_hi - p_lo);
            }
        }
        100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionStatus {
    Pending,
    Confirmed,
    Dropped,
    Replaced,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "PENDING",
            PredictionStatus::Confirmed => "CONFIRMED",
            PredictionStatus::Dropped => "DROPPED",
            PredictionStatus::Replaced => "REPLACED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub correlation_id: String,
    pub txid: Txid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub predicted_confirm_block: u64,
    pub urgency_score: f64,
    pub rbf_enabled: bool,
    pub status: PredictionStatus,
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
    pub actual_confirm_block: Option<u64>,
    pub accuracy: Option<f64>,
}

/// Wire events pushed to WebSocket subscribers (§6 protocol).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsServerEvent {
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
        authenticated: bool,
        permissions: Vec<String>,
        #[serde(rename = "serverTime")]
        server_time: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "serverTime")]
        server_time: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "price_tick")]
    PriceTick {
        #[serde(rename = "tickId")]
        tick_id: u64,
        #[serde(rename = "wallTime")]
        wall_time: chrono::DateTime<chrono::Utc>,
        #[serde(rename = "priceUsd")]
        price_usd: f64,
        confidence: f64,
        #[serde(rename = "sampleSize")]
        sample_size: usize,
    },
    #[serde(rename = "whale_alert")]
    WhaleAlert {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        txid: String,
        #[serde(rename = "btcValue")]
        btc_value: f64,
        direction: Direction,
        #[serde(rename = "flowType")]
        flow_type: FlowType,
        #[serde(rename = "urgencyScore")]
        urgency_score: f64,
        #[serde(rename = "urgencyLevel")]
        urgency_level: UrgencyLevel,
        #[serde(rename = "predictedConfirmBlock")]
        predicted_confirm_block: u64,
        #[serde(rename = "rbfEnabled")]
        rbf_enabled: bool,
        #[serde(rename = "detectedAt")]
        detected_at: chrono::DateTime<chrono::Utc>,
    },
}

impl From<&PriceEstimate> for WsServerEvent {
    fn from(p: &PriceEstimate) -> Self {
        WsServerEvent::PriceTick {
            tick_id: p.tick_id,
            wall_time: p.wall_time,
            price_usd: p.price_usd,
            confidence: p.confidence,
            sample_size: p.sample_size,
        }
    }
}

impl From<&WhaleAlert> for WsServerEvent {
    fn from(a: &WhaleAlert) -> Self {
        WsServerEvent::WhaleAlert {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> FeeSnapshot {
        FeeSnapshot {
            p10: 5.0,
            p25: 10.0,
            p50: 20.0,
            p75: 30.0,
            p90: 60.0,
            mempool_bytes: 0,
            tip_height: 800_000,
            captured_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn percentile_interpolates_between_ticks() {
        let snap = snapshot();
        // 45 sat/vB sits between p75=30 and p90=60.
        let p = snap.percentile_of(45.0);
        assert!(p > 75.0 && p < 90.0, "expected between 75 and 90, got {p}");
    }

    #[test]
    fn percentile_clamps_below_zero() {
        let snap = snapshot();
        assert_eq!(snap.percentile_of(0.0), 0.0);
    }
}
