//! End-to-end exercise of the mempool -> whale alert -> resolution
//! pipeline, wiring the real components together without any network
//! or ZMQ adapter (those need a live node).

use bitcoin::hashes::Hash;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use utxoracle_live::broadcaster::{Broadcaster, StreamKind};
use utxoracle_live::cache::TransactionCache;
use utxoracle_live::classifier::{classify, AddressBook, ClassificationConfig};
use utxoracle_live::models::{
    ParsedTransaction, PredictionRecord, PredictionStatus, WsServerEvent,
};
use utxoracle_live::resolution::{Resolver, ResolverConfig};
use utxoracle_live::tracker::PredictionStore;
use utxoracle_live::urgency::UrgencyScorer;

fn whale_tx(byte: u8, total_output_sats: u64) -> ParsedTransaction {
    ParsedTransaction {
        txid: bitcoin::Txid::from_byte_array([byte; 32]),
        first_seen_at: Instant::now(),
        total_output_sats,
        fee_sats: 12_000,
        vsize_vbytes: 250,
        rbf_enabled: false,
        input_addresses: None,
        output_addresses: None,
    }
}

#[tokio::test]
async fn whale_alert_is_durable_before_broadcast_and_resolves_on_confirmation() {
    let cache = Arc::new(Mutex::new(TransactionCache::new(1000)));
    let store = Arc::new(PredictionStore::open_in_memory().unwrap());
    let broadcaster = Broadcaster::new(64);
    let urgency = UrgencyScorer::new(Duration::from_secs(600));
    urgency.publish(utxoracle_live::models::FeeSnapshot {
        p10: 5.0,
        p25: 10.0,
        p50: 20.0,
        p75: 30.0,
        p90: 60.0,
        mempool_bytes: 0,
        tip_height: 800_000,
        captured_at: chrono::Utc::now(),
    });

    let subscriber = broadcaster.register(true, StreamKind::Whale);

    let tx = whale_tx(1, 20_000_000_000); // 200 BTC
    cache.lock().insert(tx.clone());

    let book = AddressBook::default();
    let candidate = classify(&tx, &book, &ClassificationConfig::default(), chrono::Utc::now())
        .expect("200 BTC output must classify as a whale");

    let score = urgency.score(tx.fee_rate()).expect("snapshot was published");

    let record = PredictionRecord {
        correlation_id: "corr-1".to_string(),
        txid: candidate.txid,
        created_at: chrono::Utc::now(),
        predicted_confirm_block: score.predicted_confirm_block,
        urgency_score: score.urgency_score,
        rbf_enabled: tx.rbf_enabled,
        status: PredictionStatus::Pending,
        resolved_at: None,
        actual_confirm_block: None,
        accuracy: None,
    };

    // Durability before broadcast (§3, §8 invariant 3).
    store.insert(&record).expect("insert must succeed before fan-out");
    assert!(store.get("corr-1").unwrap().is_some());

    let alert = utxoracle_live::models::WhaleAlert {
        candidate,
        urgency_score: score.urgency_score,
        urgency_level: score.urgency_level,
        predicted_confirm_block: score.predicted_confirm_block,
        rbf_enabled: tx.rbf_enabled,
        correlation_id: "corr-1".to_string(),
    };
    broadcaster.broadcast(WsServerEvent::from(&alert));

    let mut subscriber = subscriber;
    let received = subscriber.receiver.recv().await.expect("subscriber should receive the alert");
    match received {
        WsServerEvent::WhaleAlert { correlation_id, .. } => assert_eq!(correlation_id, "corr-1"),
        other => panic!("expected whale_alert, got {other:?}"),
    }

    let resolver = Resolver::new(
        store.clone(),
        cache.clone(),
        None,
        ResolverConfig {
            drop_timeout: Duration::from_secs(7200),
            poll_interval: Duration::from_secs(60),
        },
    );
    resolver.resolve_block(score.predicted_confirm_block, &[tx.txid]).await;

    let row = store.get("corr-1").unwrap().unwrap();
    assert_eq!(row.status, "CONFIRMED");
    assert_eq!(row.actual_confirm_block, Some(score.predicted_confirm_block));
}

#[tokio::test]
async fn sub_threshold_transfer_is_not_classified_as_whale() {
    let tx = whale_tx(2, 1_000_000); // 0.01 BTC
    let book = AddressBook::default();
    let result = classify(&tx, &book, &ClassificationConfig::default(), chrono::Utc::now());
    assert!(result.is_none());
}
