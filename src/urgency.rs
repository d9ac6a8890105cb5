//! Urgency Scorer (§4.4): holds the latest `FeeSnapshot` behind an
//! atomic pointer swap and scores transactions against it. The
//! snapshot is refreshed by a single task (§5); readers never block.

use crate::models::{FeeSnapshot, UrgencyLevel};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct UrgencyScore {
    pub urgency_score: f64,
    pub urgency_level: UrgencyLevel,
    pub predicted_confirm_block: u64,
    pub stale: bool,
}

/// Piecewise-linear map from fee percentile to urgency (§4.4).
fn percentile_to_urgency(p: f64) -> f64 {
    let p = p.clamp(0.0, 100.0);
    let (lo_p, hi_p, lo_u, hi_u) = if p <= 10.0 {
        (0.0, 10.0, 0.0, 0.2)
    } else if p <= 25.0 {
        (10.0, 25.0, 0.2, 0.4)
    } else if p <= 50.0 {
        (25.0, 50.0, 0.4, 0.6)
    } else if p <= 75.0 {
        (50.0, 75.0, 0.6, 0.8)
    } else if p <= 90.0 {
        (75.0, 90.0, 0.8, 0.95)
    } else {
        (90.0, 100.0, 0.95, 1.0)
    };
    if (hi_p - lo_p).abs() < f64::EPSILON {
        return lo_u;
    }
    let t = (p - lo_p) / (hi_p - lo_p);
    lo_u + t * (hi_u - lo_u)
}

// HIGH is reserved for the top decile (the p>=90 bucket tops out at a
// score of 0.95); a tx sitting in the p75-90 bucket is already ahead
// of most of the mempool but not yet in the fastest lane, so it reads
// as MEDIUM rather than HIGH.
fn urgency_level(score: f64) -> UrgencyLevel {
    if score < 0.4 {
        UrgencyLevel::Low
    } else if score < 0.95 {
        UrgencyLevel::Medium
    } else {
        UrgencyLevel::High
    }
}

fn blocks_for_score(score: f64) -> u64 {
    if score >= 0.95 {
        1
    } else if score >= 0.5 {
        3
    } else {
        6
    }
}

/// Shared, lock-free-reads holder of the latest `FeeSnapshot` plus the
/// staleness policy from §4.4 ("after `staleSnapshotMaxAge` degrade all
/// scores to MEDIUM with a flag").
pub struct UrgencyScorer {
    snapshot: ArcSwap<Option<FeeSnapshot>>,
    stale_max_age: Duration,
}

impl UrgencyScorer {
    pub fn new(stale_max_age: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(None),
            stale_max_age,
        }
    }

    /// Atomically replace the latest snapshot. Called from the single
    /// refresh task only (§5).
    pub fn publish(&self, snapshot: FeeSnapshot) {
        self.snapshot.store(Arc::new(Some(snapshot)));
    }

    pub fn latest(&self) -> Option<FeeSnapshot> {
        (**self.snapshot.load()).clone()
    }

    /// Score a fee rate against the latest snapshot. Returns `None`
    /// only when no snapshot has ever been published.
    pub fn score(&self, fee_rate: f64) -> Option<UrgencyScore> {
        let snapshot = self.latest()?;
        let age = snapshot.age();
        let stale = age.to_std().unwrap_or(Duration::MAX) > self.stale_max_age;

        if stale {
            return Some(UrgencyScore {
                urgency_score: 0.5,
                urgency_level: UrgencyLevel::Medium,
                predicted_confirm_block: snapshot.tip_height + 3,
                stale: true,
            });
        }

        let percentile = snapshot.percentile_of(fee_rate);
        let urgency_score = percentile_to_urgency(percentile);
        Some(UrgencyScore {
            urgency_score,
            urgency_level: urgency_level(urgency_score),
            predicted_confirm_block: snapshot.tip_height + blocks_for_score(urgency_score),
            stale: false,
        })
    }
}
