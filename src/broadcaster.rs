//! Signal Broadcaster (§4.6): the WebSocket fan-out server. Each
//! subscriber owns a bounded send queue and a single writer task;
//! producers enqueue without blocking and a full queue evicts the
//! subscriber rather than stalling the pipeline (§3, §8 invariant 4).
//!
//! JWT verification mirrors the teacher's `auth::jwt::JwtHandler`;
//! per-subscriber fan-out follows the teacher's `broadcast`-channel
//! signal distribution generalized into an explicit per-client queue
//! so one slow reader can be evicted independently.

use crate::models::WsServerEvent;
use jsonwebtoken::{decode, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberClaims {
    pub sub: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: Option<String>,
}

pub struct AuthVerifier {
    secret: String,
}

impl AuthVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn verify(&self, token: &str) -> Result<SubscriberClaims, jsonwebtoken::errors::Error> {
        let decoded = decode::<SubscriberClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(decoded.claims)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    AuthFailure = 1008,
    Internal = 1011,
    BackpressureEviction = 1013,
}

/// `/ws/<stream>` path selector (§6). A subscriber only receives
/// events matching its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Whale,
    Price,
}

impl StreamKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whale" => Some(StreamKind::Whale),
            "price" => Some(StreamKind::Price),
            _ => None,
        }
    }

    fn matches(self, event: &WsServerEvent) -> bool {
        match (self, event) {
            (StreamKind::Whale, WsServerEvent::WhaleAlert { .. }) => true,
            (StreamKind::Price, WsServerEvent::PriceTick { .. }) => true,
            // Welcome/Pong are control-plane replies, always delivered.
            (_, WsServerEvent::Welcome { .. } | WsServerEvent::Pong { .. }) => true,
            _ => false,
        }
    }
}

/// Per-subscriber token bucket (§4.6 "rate-limiting per subscriber is
/// applied at enqueue"). Refills continuously at `rate_per_sec`,
/// capped at one second's worth of burst.
struct RateLimiter {
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec as f64,
            tokens: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    /// Returns `true` if a token was available and consumed.
    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Subscriber {
    id: String,
    queue: mpsc::Sender<WsServerEvent>,
    authenticated: bool,
    stream: StreamKind,
    last_pong: Arc<parking_lot::Mutex<Instant>>,
    limiter: parking_lot::Mutex<RateLimiter>,
}

/// Owns the subscriber registry; lives behind the dispatcher task
/// (§9 "Global mutable state ... lives behind the Broadcaster's
/// dispatcher task").
pub struct Broadcaster {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    queue_size: usize,
    rate_limit_per_sec: u32,
    evictions: AtomicU64,
    rate_limit_drops: AtomicU64,
}

pub struct SubscriberHandle {
    pub id: String,
    pub receiver: mpsc::Receiver<WsServerEvent>,
}

impl Broadcaster {
    pub fn new(queue_size: usize) -> Arc<Self> {
        Self::with_rate_limit(queue_size, u32::MAX)
    }

    pub fn with_rate_limit(queue_size: usize, rate_limit_per_sec: u32) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_size,
            rate_limit_per_sec,
            evictions: AtomicU64::new(0),
            rate_limit_drops: AtomicU64::new(0),
        })
    }

    pub fn register(self: &Arc<Self>, authenticated: bool, stream: StreamKind) -> SubscriberHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.queue_size);
        let subscriber = Subscriber {
            id: id.clone(),
            queue: tx,
            authenticated,
            stream,
            last_pong: Arc::new(parking_lot::Mutex::new(Instant::now())),
            limiter: parking_lot::Mutex::new(RateLimiter::new(self.rate_limit_per_sec)),
        };
        self.subscribers.write().insert(id.clone(), subscriber);
        SubscriberHandle { id, receiver: rx }
    }

    pub fn unregister(&self, id: &str) {
        self.subscribers.write().remove(id);
    }

    pub fn touch_pong(&self, id: &str) {
        if let Some(sub) = self.subscribers.read().get(id) {
            *sub.last_pong.lock() = Instant::now();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn rate_limit_drop_count(&self) -> u64 {
        self.rate_limit_drops.load(Ordering::Relaxed)
    }

    /// Enqueue an event into every registered subscriber's queue
    /// without blocking. A full queue marks that subscriber dead and
    /// removes it; the producer's call always returns promptly
    /// (§3, §4.6, §8 invariant 4).
    pub fn broadcast(&self, event: WsServerEvent) {
        let mut dead = Vec::new();
        let mut rate_limited = 0u64;
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.values() {
                if !sub.stream.matches(&event) {
                    continue;
                }
                if !sub.limiter.lock().try_acquire() {
                    rate_limited += 1;
                    continue;
                }
                match sub.queue.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dead.push(sub.id.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(sub.id.clone());
                    }
                }
            }
        }
        if rate_limited > 0 {
            self.rate_limit_drops.fetch_add(rate_limited, Ordering::Relaxed);
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in dead {
                if subscribers.remove(&id).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    warn!(component = "broadcaster", subscriber_id = %id, "subscriber evicted: queue full");
                }
            }
        }
    }

    /// Enqueue a single event into exactly one subscriber's queue (a
    /// pong reply, say), bypassing the fan-out broadcast. Returns
    /// `false` if the subscriber is unknown or its queue is full.
    pub fn send_to(&self, id: &str, event: WsServerEvent) -> bool {
        match self.subscribers.read().get(id) {
            Some(sub) => sub.queue.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Idempotent against an already-dead subscriber: a second
    /// enqueue targeting a removed id is simply absent from the
    /// registry and does nothing (§8 idempotence law).
    pub fn unresponsive_subscribers(&self, ping_timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.subscribers
            .read()
            .values()
            .filter(|s| now.duration_since(*s.last_pong.lock()) > ping_timeout)
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Per-subscriber writer: drains the queue and writes to the socket;
/// a write error marks the subscriber dead (§4.6). This is generic
/// over the actual sink so it can be driven by axum's WebSocket
/// sender without pulling axum into this module's test surface.
pub async fn drain_to_sink<F, Fut>(
    mut receiver: mpsc::Receiver<WsServerEvent>,
    mut send: F,
) -> Result<(), CloseCode>
where
    F: FnMut(WsServerEvent) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    while let Some(event) = receiver.recv().await {
        if !send(event).await {
            return Err(CloseCode::Internal);
        }
    }
    Ok(())
}

pub fn welcome_event(
    subscriber_id: &str,
    authenticated: bool,
    permissions: Vec<String>,
) -> WsServerEvent {
    WsServerEvent::Welcome {
        subscriber_id: subscriber_id.to_string(),
        authenticated,
        permissions,
        server_time: chrono::Utc::now(),
    }
}

pub fn pong_event() -> WsServerEvent {
    WsServerEvent::Pong {
        server_time: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, FlowType, PriceEstimate, UrgencyLevel};

    fn price_tick(id: u64) -> WsServerEvent {
        WsServerEvent::from(&PriceEstimate {
            tick_id: id,
            wall_time: chrono::Utc::now(),
            price_usd: 50_000.0,
            confidence: 0.9,
            sample_size: 2000,
            histogram_digest: "deadbeef".into(),
        })
    }

    fn whale_alert_event() -> WsServerEvent {
        use bitcoin::hashes::Hash;
        WsServerEvent::from(&crate::models::WhaleAlert {
            candidate: crate::models::WhaleCandidate {
                txid: bitcoin::Txid::from_byte_array([9u8; 32]),
                btc_value: 123.0,
                direction: Direction::In,
                flow_type: FlowType::WhaleTransfer,
                detected_at: chrono::Utc::now(),
            },
            urgency_score: 0.5,
            urgency_level: UrgencyLevel::Medium,
            predicted_confirm_block: 800_100,
            rbf_enabled: false,
            correlation_id: "corr-test".into(),
        })
    }

    #[tokio::test]
    async fn subscriber_only_receives_events_for_its_stream() {
        let b = Broadcaster::new(8);
        let mut whale_sub = b.register(true, StreamKind::Whale);
        let mut price_sub = b.register(true, StreamKind::Price);

        b.broadcast(price_tick(1));
        b.broadcast(whale_alert_event());

        let price_received = price_sub.receiver.try_recv().expect("price subscriber should get the tick");
        assert!(matches!(price_received, WsServerEvent::PriceTick { .. }));
        assert!(price_sub.receiver.try_recv().is_err(), "price subscriber must not get the whale alert");

        let whale_received = whale_sub.receiver.try_recv().expect("whale subscriber should get the alert");
        assert!(matches!(whale_received, WsServerEvent::WhaleAlert { .. }));
        assert!(whale_sub.receiver.try_recv().is_err(), "whale subscriber must not get the price tick");
    }

    #[test]
    fn broadcast_to_no_subscribers_is_a_noop() {
        let b = Broadcaster::new(4);
        b.broadcast(price_tick(1));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_evicts_subscriber_without_blocking() {
        let b = Broadcaster::new(2);
        let handle = b.register(true, StreamKind::Price);
        assert_eq!(b.subscriber_count(), 1);

        // Fill the queue past capacity without a reader draining it.
        for i in 0..10 {
            b.broadcast(price_tick(i));
        }

        assert_eq!(b.subscriber_count(), 0, "subscriber should be evicted once its queue saturates");
        assert_eq!(b.eviction_count(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn second_enqueue_after_eviction_is_idempotent() {
        let b = Broadcaster::new(1);
        let _handle = b.register(false, StreamKind::Price);
        b.broadcast(price_tick(1));
        b.broadcast(price_tick(2)); // first full send may evict here
        b.broadcast(price_tick(3)); // must not panic against an absent subscriber
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn rate_limited_subscriber_drops_excess_without_eviction() {
        let b = Broadcaster::with_rate_limit(64, 2);
        let mut sub = b.register(true, StreamKind::Price);

        // Burst past the 2-token bucket; excess is dropped, not evicted.
        for i in 0..5 {
            b.broadcast(price_tick(i));
        }

        assert_eq!(b.subscriber_count(), 1, "rate limiting must not evict the subscriber");
        assert!(b.rate_limit_drop_count() >= 1);

        let mut received = 0;
        while sub.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert!(received < 5, "some events should have been rate-limited away");
    }

    #[test]
    fn unused_direction_and_flow_variants_serialize() {
        // Smoke-check the wire enum variants used by whale_alert payloads.
        let _ = Direction::Neutral;
        let _ = FlowType::Unknown;
        let _ = UrgencyLevel::High;
    }
}
