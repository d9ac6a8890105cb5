//! Property tests for the quantified invariants that hold across the
//! pipeline regardless of input shape: cache bound, at-most-once
//! resolution, keep-best upsert ordering, and reconnect backoff bounds.

use bitcoin::hashes::Hash;
use proptest::prelude::*;
use std::time::{Duration, Instant};
use utxoracle_live::adapters::{AdapterState, Backoff, StateHandle};
use utxoracle_live::cache::TransactionCache;
use utxoracle_live::models::{ParsedTransaction, PredictionRecord, PredictionStatus, Txid};
use utxoracle_live::tracker::PredictionStore;

fn tx_with(byte: u8) -> ParsedTransaction {
    ParsedTransaction {
        txid: Txid::from_byte_array([byte; 32]),
        first_seen_at: Instant::now(),
        total_output_sats: 1,
        fee_sats: 1,
        vsize_vbytes: 100,
        rbf_enabled: false,
        input_addresses: None,
        output_addresses: None,
    }
}

proptest! {
    /// §8 invariant: the cache never exceeds its configured bound no
    /// matter the insert sequence.
    #[test]
    fn cache_never_exceeds_max_size(max_size in 1usize..32, inserts in 0usize..500) {
        let mut cache = TransactionCache::new(max_size);
        for i in 0..inserts {
            cache.insert(tx_with((i % 256) as u8));
            prop_assert!(cache.len() <= max_size);
        }
    }

    /// §8 invariant: shrinking to any target leaves the cache at or
    /// below that target, and never raises it back up afterward.
    #[test]
    fn shrink_to_always_converges(initial in 1usize..64, fill in 0usize..64, target in 1usize..64) {
        let mut cache = TransactionCache::new(initial);
        for i in 0..fill {
            cache.insert(tx_with((i % 256) as u8));
        }
        cache.shrink_to(target);
        prop_assert!(cache.len() <= target.max(1));
        for i in 0..fill {
            cache.insert(tx_with(((fill + i) % 256) as u8));
            prop_assert!(cache.len() <= target.max(1));
        }
    }

    /// §8 invariant 2: once a prediction reaches a terminal status, no
    /// further `resolve()` call can change it, regardless of how many
    /// times or with what status it's retried.
    #[test]
    fn resolution_is_at_most_once_under_repeated_attempts(
        attempts in 1usize..8,
        second_status in prop_oneof![
            Just(PredictionStatus::Confirmed),
            Just(PredictionStatus::Dropped),
            Just(PredictionStatus::Replaced),
        ],
    ) {
        let store = PredictionStore::open_in_memory().unwrap();
        let record = PredictionRecord {
            correlation_id: "prop-1".to_string(),
            txid: Txid::from_byte_array([3u8; 32]),
            created_at: chrono::Utc::now(),
            predicted_confirm_block: 100,
            urgency_score: 0.5,
            rbf_enabled: false,
            status: PredictionStatus::Pending,
            resolved_at: None,
            actual_confirm_block: None,
            accuracy: None,
        };
        store.insert(&record).unwrap();

        let first = store
            .resolve("prop-1", PredictionStatus::Confirmed, chrono::Utc::now(), Some(101), Some(0.9))
            .unwrap();
        prop_assert!(first);

        for _ in 0..attempts {
            let changed = store
                .resolve("prop-1", second_status, chrono::Utc::now(), Some(999), Some(0.1))
                .unwrap();
            prop_assert!(!changed, "a resolved prediction must never be re-resolved");
        }

        let row = store.get("prop-1").unwrap().unwrap();
        prop_assert_eq!(row.status, "CONFIRMED");
        prop_assert_eq!(row.actual_confirm_block, Some(101));
    }

    /// §8 invariant 7: "keep best confidence" — a write is only
    /// accepted when it is not a regression (lower confidence on an
    /// already-valid row), independent of the specific values chosen.
    #[test]
    fn upsert_never_regresses_confidence(
        first_confidence in 0.0f64..1.0,
        second_confidence in 0.0f64..1.0,
    ) {
        let store = PredictionStore::open_in_memory().unwrap();
        store
            .upsert_price_analysis("2026-01-01", 10_000.0, None, first_confidence, 10, true)
            .unwrap();

        store
            .upsert_price_analysis("2026-01-01", 20_000.0, None, second_confidence, 20, true)
            .unwrap();

        let (price, confidence, _) = store.get_price_analysis("2026-01-01").unwrap().unwrap();
        if second_confidence >= first_confidence {
            prop_assert_eq!(price, 20_000.0);
            prop_assert_eq!(confidence, second_confidence);
        } else {
            prop_assert_eq!(price, 10_000.0);
            prop_assert_eq!(confidence, first_confidence);
        }
    }

    /// §8 invariant: the reconnect backoff delay is always within the
    /// documented bound (exponential with jitter, capped at 60s) until
    /// the circuit breaker threshold trips.
    #[test]
    fn backoff_delay_stays_within_bound(threshold in 1u32..12) {
        let mut backoff = Backoff::new(threshold);
        for _ in 0..threshold {
            let delay = backoff.next_delay().expect("within threshold must yield a delay");
            prop_assert!(delay <= Duration::from_millis(75_000), "delay {:?} exceeds the 60s cap plus jitter", delay);
        }
        prop_assert!(backoff.next_delay().is_none(), "threshold must trip the circuit breaker");
    }
}

#[test]
fn state_handle_reflects_latest_set_without_blocking_reader() {
    let (handle, rx) = StateHandle::new();
    assert_eq!(*rx.borrow(), AdapterState::Disconnected);
    handle.set(AdapterState::Connected);
    assert_eq!(handle.get(), AdapterState::Connected);
    assert_eq!(*rx.borrow(), AdapterState::Connected);
}
