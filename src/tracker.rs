//! Correlation Tracker (§4.7): durable store of `PredictionRecord`
//! entries, a resolver that closes the loop between whale predictions
//! and confirmed blocks, and an accuracy monitor. Schema and
//! open/WAL conventions follow the teacher's `backtest_v2` recorders
//! (`delta_recorder.rs`, `trade_recorder.rs`).

use crate::error::OracleError;
use crate::models::{PredictionRecord, PredictionStatus};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS predictions (
    correlation_id TEXT PRIMARY KEY,
    txid TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    predicted_confirm_block INTEGER NOT NULL,
    urgency_score REAL NOT NULL,
    rbf_enabled INTEGER NOT NULL,
    status TEXT NOT NULL,
    resolved_at INTEGER,
    actual_confirm_block INTEGER,
    accuracy REAL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_predictions_status ON predictions(status);
CREATE INDEX IF NOT EXISTS idx_predictions_txid ON predictions(txid);
CREATE INDEX IF NOT EXISTS idx_predictions_created_at ON predictions(created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_resolved_at ON predictions(resolved_at);

CREATE TABLE IF NOT EXISTS price_analysis (
    date TEXT PRIMARY KEY,
    utxoracle_price REAL NOT NULL,
    mempool_price REAL,
    confidence REAL NOT NULL,
    tx_count INTEGER NOT NULL,
    is_valid INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Single-writer analytical store; all mutation flows through this
/// struct's owning task (§5), wrapped in `parking_lot::Mutex` as the
/// teacher does for its `backtest_v2` recorders.
pub struct PredictionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PredictionStore {
    pub fn open(db_path: &str) -> Result<Self, OracleError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OracleError::StoreIntegrityError(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        info!(component = "correlation_tracker", path = db_path, "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, OracleError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert the prediction record for an alert, invoked synchronously
    /// before the Broadcaster fans the alert out (§4.7, §3 invariant).
    /// Writes go through an exponential-backoff retry since the store
    /// may be transiently locked (§4.7).
    pub fn insert(&self, record: &PredictionRecord) -> Result<(), OracleError> {
        with_retry(|| {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO predictions
                 (correlation_id, txid, created_at, predicted_confirm_block, urgency_score, rbf_enabled, status, resolved_at, actual_confirm_block, accuracy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL)",
                params![
                    record.correlation_id,
                    record.txid.to_string(),
                    record.created_at.timestamp(),
                    record.predicted_confirm_block as i64,
                    record.urgency_score,
                    record.rbf_enabled as i64,
                    record.status.as_str(),
                ],
            )
            .map_err(OracleError::from)
        })
    }

    /// Resolve a PENDING prediction. The `PENDING -> terminal`
    /// transition is at-most-once: the `WHERE status = 'PENDING'`
    /// guard makes a duplicate resolution attempt a no-op rather than
    /// a second write (§8 invariant 2).
    pub fn resolve(
        &self,
        correlation_id: &str,
        status: PredictionStatus,
        resolved_at: chrono::DateTime<chrono::Utc>,
        actual_confirm_block: Option<u64>,
        accuracy: Option<f64>,
    ) -> Result<bool, OracleError> {
        with_retry(|| {
            let conn = self.conn.lock();
            let updated = conn.execute(
                "UPDATE predictions
                 SET status = ?1, resolved_at = ?2, actual_confirm_block = ?3, accuracy = ?4
                 WHERE correlation_id = ?5 AND status = 'PENDING'",
                params![
                    status.as_str(),
                    resolved_at.timestamp(),
                    actual_confirm_block.map(|b| b as i64),
                    accuracy,
                    correlation_id,
                ],
            )?;
            Ok(updated > 0)
        })
    }

    pub fn pending(&self) -> Result<Vec<PendingPrediction>, OracleError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT correlation_id, txid, created_at, predicted_confirm_block, urgency_score
             FROM predictions WHERE status = 'PENDING'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PendingPrediction {
                    correlation_id: row.get(0)?,
                    txid: row.get(1)?,
                    created_at: row.get::<_, i64>(2)?,
                    predicted_confirm_block: row.get::<_, i64>(3)? as u64,
                    urgency_score: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, correlation_id: &str) -> Result<Option<PredictionRow>, OracleError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT correlation_id, txid, created_at, predicted_confirm_block, urgency_score,
                    rbf_enabled, status, resolved_at, actual_confirm_block, accuracy
             FROM predictions WHERE correlation_id = ?1",
            params![correlation_id],
            PredictionRow::from_row,
        )
        .optional()
        .map_err(OracleError::from)
    }

    /// Retention cleanup: purge records older than `retention_days`
    /// (§4.7, §8 invariant 8).
    pub fn purge_older_than(&self, retention_days: i64) -> Result<usize, OracleError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days)).timestamp();
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM predictions WHERE created_at < ?1", params![cutoff])?;
        Ok(deleted)
    }

    /// "Keep best confidence" upsert for `price_analysis` (§6, §8
    /// invariant 7): a new row replaces an existing one when the new
    /// write is at least as good — confidence is not a regression (a
    /// fresher read at the same confidence still wins, per spec.md
    /// S6), or the existing row is invalid and the new one is valid.
    /// A strictly worse or still-invalid write is rejected.
    pub fn upsert_price_analysis(
        &self,
        date: &str,
        utxoracle_price: f64,
        mempool_price: Option<f64>,
        confidence: f64,
        tx_count: u64,
        is_valid: bool,
    ) -> Result<bool, OracleError> {
        let conn = self.conn.lock();
        let existing: Option<(f64, bool)> = conn
            .query_row(
                "SELECT confidence, is_valid FROM price_analysis WHERE date = ?1",
                params![date],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;

        let should_write = match existing {
            None => true,
            Some((existing_confidence, existing_valid)) => {
                if is_valid {
                    !existing_valid || confidence >= existing_confidence
                } else {
                    !existing_valid && confidence > existing_confidence
                }
            }
        };

        if !should_write {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO price_analysis (date, utxoracle_price, mempool_price, confidence, tx_count, is_valid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(date) DO UPDATE SET
                utxoracle_price = excluded.utxoracle_price,
                mempool_price = excluded.mempool_price,
                confidence = excluded.confidence,
                tx_count = excluded.tx_count,
                is_valid = excluded.is_valid",
            params![date, utxoracle_price, mempool_price, confidence, tx_count as i64, is_valid as i64],
        )?;
        Ok(true)
    }

    /// Returns `(utxoracle_price, confidence, is_valid)` for a date,
    /// used by the read-only HTTP API's historical projection.
    pub fn get_price_analysis(&self, date: &str) -> Result<Option<(f64, f64, bool)>, OracleError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT utxoracle_price, confidence, is_valid FROM price_analysis WHERE date = ?1",
            params![date],
            |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
        )
        .optional()
        .map_err(OracleError::from)
    }

    /// Rows resolved (terminal status reached) at or after `since`
    /// (unix seconds), for the accuracy monitor's rolling windows.
    pub fn resolved_since(&self, since: i64) -> Result<Vec<PredictionRow>, OracleError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT correlation_id, txid, created_at, predicted_confirm_block, urgency_score,
                    rbf_enabled, status, resolved_at, actual_confirm_block, accuracy
             FROM predictions WHERE resolved_at IS NOT NULL AND resolved_at >= ?1",
        )?;
        let rows = stmt
            .query_map(params![since], PredictionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn reachable(&self) -> bool {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |_| Ok(()))
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct PendingPrediction {
    pub correlation_id: String,
    pub txid: String,
    pub created_at: i64,
    pub predicted_confirm_block: u64,
    pub urgency_score: f64,
}

#[derive(Debug, Clone)]
pub struct PredictionRow {
    pub correlation_id: String,
    pub txid: String,
    pub created_at: i64,
    pub predicted_confirm_block: u64,
    pub urgency_score: f64,
    pub rbf_enabled: bool,
    pub status: String,
    pub resolved_at: Option<i64>,
    pub actual_confirm_block: Option<u64>,
    pub accuracy: Option<f64>,
}

impl PredictionRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            correlation_id: row.get(0)?,
            txid: row.get(1)?,
            created_at: row.get(2)?,
            predicted_confirm_block: row.get::<_, i64>(3)? as u64,
            urgency_score: row.get(4)?,
            rbf_enabled: row.get::<_, i64>(5)? != 0,
            status: row.get(6)?,
            resolved_at: row.get(7)?,
            actual_confirm_block: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
            accuracy: row.get(9)?,
        })
    }
}

/// Retry wrapper with exponential backoff for a store that may be
/// transiently locked (§4.7).
fn with_retry<T>(mut op: impl FnMut() -> Result<T, OracleError>) -> Result<T, OracleError> {
    let mut delay = Duration::from_millis(20);
    for attempt in 0..5 {
        match op() {
            Ok(v) => return Ok(v),
            Err(OracleError::StoreUnavailable(msg)) if attempt < 4 => {
                warn!(component = "correlation_tracker", attempt, error = %msg, "store busy, retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns or errors before exhausting attempts")
}

/// Accuracy: `0.6*timingScore + 0.4*urgencyScore` (§4.7). Both terms
/// are derived from the same `predicted - actual` block difference:
/// `timingScore` from its magnitude, `urgencyScore` from its sign and
/// magnitude together, so a prediction that confirmed right on target
/// scores 0.5 on the urgency term, one that confirmed faster than
/// predicted scores above 0.5, and one that confirmed slower scores
/// below — rather than reusing the urgency level assigned at emission
/// time, which two predictions with identical confirmation timing
/// could otherwise differ on for reasons unrelated to the outcome.
pub fn compute_accuracy(predicted_confirm_block: u64, actual_confirm_block: u64) -> f64 {
    let signed_diff = predicted_confirm_block as i64 - actual_confirm_block as i64;
    let diff = signed_diff.unsigned_abs() as f64;
    let timing_score = if diff <= 1.0 {
        1.0
    } else if diff >= 6.0 {
        0.0
    } else {
        1.0 - (diff - 1.0) / 5.0 * 0.5
    };
    let urgency_score = (0.5 + signed_diff as f64 / 12.0).clamp(0.0, 1.0);
    0.6 * timing_score + 0.4 * urgency_score
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn sample_record(correlation_id: &str) -> PredictionRecord {
        PredictionRecord {
            correlation_id: correlation_id.to_string(),
            txid: bitcoin::Txid::from_byte_array([9u8; 32]),
            created_at: chrono::Utc::now(),
            predicted_confirm_block: 800_001,
            urgency_score: 0.6,
            rbf_enabled: false,
            status: PredictionStatus::Pending,
            resolved_at: None,
            actual_confirm_block: None,
            accuracy: None,
        }
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let store = PredictionStore::open_in_memory().unwrap();
        let record = sample_record("c1");
        store.insert(&record).unwrap();
        let row = store.get("c1").unwrap().unwrap();
        assert_eq!(row.status, "PENDING");
    }

    #[test]
    fn resolution_is_at_most_once() {
        let store = PredictionStore::open_in_memory().unwrap();
        store.insert(&sample_record("c2")).unwrap();
        let now = chrono::Utc::now();
        let first = store
            .resolve("c2", PredictionStatus::Confirmed, now, Some(800_002), Some(0.9))
            .unwrap();
        assert!(first);
        let second = store
            .resolve("c2", PredictionStatus::Dropped, now, None, None)
            .unwrap();
        assert!(!second, "second resolution must be a no-op");
        let row = store.get("c2").unwrap().unwrap();
        assert_eq!(row.status, "CONFIRMED");
    }

    #[test]
    fn keep_best_upsert_matches_s6() {
        // S6: write confidence=1.0/valid, attempt to overwrite with a
        // worse write (rejected), then a second confidence=1.0/valid
        // write with a new price (accepted as "no worse").
        let store = PredictionStore::open_in_memory().unwrap();
        assert!(store
            .upsert_price_analysis("2026-07-28", 50_000.0, None, 1.0, 100, true)
            .unwrap());

        assert!(!store
            .upsert_price_analysis("2026-07-28", 0.0, None, 0.0, 0, false)
            .unwrap());
        let row = store
            .get_price_analysis("2026-07-28")
            .unwrap()
            .expect("row still present");
        assert_eq!(row.0, 50_000.0, "worse write must not replace the row");

        assert!(store
            .upsert_price_analysis("2026-07-28", 51_000.0, None, 1.0, 120, true)
            .unwrap());
        let row = store.get_price_analysis("2026-07-28").unwrap().unwrap();
        assert_eq!(row.0, 51_000.0, "equal-confidence valid write replaces per spec.md S6");
    }

    #[test]
    fn accuracy_matches_s5_scenario() {
        // S5: predicted H+1, actual H+2 -> predicted_confirm_block=100,
        // actual_confirm_block=101, signed diff=-1, |diff|=1 ->
        // timingScore=1.0, urgencyScore=0.5-1/12.
        let accuracy = compute_accuracy(100, 101);
        let expected_urgency = 0.5 - 1.0 / 12.0;
        assert!((accuracy - (0.6 * 1.0 + 0.4 * expected_urgency)).abs() < 1e-9);
    }

    #[test]
    fn identical_timing_error_yields_identical_accuracy() {
        // Two predictions with the same predicted/actual block gap must
        // score identically regardless of any fee-market state at
        // emission time, since that state no longer feeds the formula.
        let a = compute_accuracy(500_000, 500_001);
        let b = compute_accuracy(900_000, 900_001);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn confirming_faster_than_predicted_scores_above_confirming_slower() {
        let faster = compute_accuracy(100, 98); // confirmed 2 blocks early
        let slower = compute_accuracy(100, 102); // confirmed 2 blocks late
        assert!(faster > slower);
    }

    #[test]
    fn purge_removes_old_records() {
        let store = PredictionStore::open_in_memory().unwrap();
        let mut old = sample_record("old");
        old.created_at = chrono::Utc::now() - chrono::Duration::days(200);
        store.insert(&old).unwrap();
        store.insert(&sample_record("new")).unwrap();

        let deleted = store.purge_older_than(90).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("new").unwrap().is_some());
    }
}
