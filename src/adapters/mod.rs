//! Upstream Adapters (§4.1): one wrapper per external source. Each
//! adapter exposes a uniform `Start()/State()/Stop()` contract with
//! reconnect semantics; this module holds the shared backoff/circuit
//! breaker machinery plus the adapter-state watch channel, following
//! the teacher's `polymarket_ws`/`binance_session` reconnect-loop
//! pattern generalized into a reusable helper.

pub mod fee_market;
pub mod rawblock;
pub mod rawtx;
pub mod rpc;

use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;

/// §4.1 state machine: DISCONNECTED -> RECONNECTING -> CONNECTED,
/// with FAILED reached after `circuitBreakerThreshold` consecutive
/// failures. Stop() takes any state to DISCONNECTED (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdapterState {
    Disconnected,
    Reconnecting,
    Connected,
    Failed,
}

/// Exponential backoff with uniform jitter (§4.1): 1s -> 2s -> 4s ->
/// 8s, capped at 60s, +/-25% jitter. After `threshold` consecutive
/// failures the adapter should stop retrying and enter FAILED.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    threshold: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(threshold: u32) -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.25,
            threshold,
            attempt: 0,
        }
    }

    /// Delay for the next reconnect attempt, or `None` once the
    /// circuit-breaker threshold has been exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.threshold {
            return None;
        }
        let exp = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        let base_delay = self.base.saturating_mul(exp).min(self.cap);
        self.attempt += 1;

        let mut rng = rand::thread_rng();
        let jitter_frac: f64 = rng.gen_range(-self.jitter..=self.jitter);
        let millis = base_delay.as_millis() as f64 * (1.0 + jitter_frac);
        Some(Duration::from_millis(millis.max(0.0) as u64))
    }

    /// Successful reconnection resets the backoff counter (§4.1).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Shared state-publishing handle every adapter owns: a `watch`
/// channel so the Orchestrator's health aggregation and `/health`
/// endpoint can read the current state without blocking the adapter.
#[derive(Clone)]
pub struct StateHandle {
    tx: watch::Sender<AdapterState>,
}

impl StateHandle {
    pub fn new() -> (Self, watch::Receiver<AdapterState>) {
        let (tx, rx) = watch::channel(AdapterState::Disconnected);
        (Self { tx }, rx)
    }

    pub fn set(&self, state: AdapterState) {
        let _ = self.tx.send(state);
    }

    pub fn get(&self) -> AdapterState {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_spec_defaults() {
        let mut b = Backoff::new(10);
        // Strip jitter by checking bounds rather than exact values.
        for expected_base in [1u64, 2, 4, 8, 16, 32, 60, 60, 60, 60] {
            let d = b.next_delay().unwrap();
            let lo = (expected_base as f64 * 0.75) as u64;
            let hi = (expected_base as f64 * 1.25) as u64 + 1;
            assert!(
                d.as_secs() <= hi && d.as_millis() as u64 + 1 >= lo.saturating_sub(1) * 1000 / 1000,
                "delay {:?} out of range for base {}s",
                d,
                expected_base
            );
        }
        assert!(b.next_delay().is_none(), "threshold should stop retries");
    }

    #[test]
    fn reset_restarts_from_first_step() {
        let mut b = Backoff::new(10);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempts(), 2);
        b.reset();
        assert_eq!(b.attempts(), 0);
    }
}
