//! Raw-transaction feed adapter (§4.1, §6): subscribes to a Bitcoin
//! node's ZMQ `rawtx` publisher and yields parsed transactions on a
//! bounded channel. ZMQ's blocking recv runs on a dedicated
//! `spawn_blocking` worker, bridged into async via `mpsc`, following
//! the pack's ZMQ-listener pattern (grounded in the wider
//! Bitcoin-infra examples since the teacher's own push feeds are
//! WebSocket-based).

use super::{AdapterState, Backoff, StateHandle};
use crate::error::OracleError;
use crate::models::{ParsedTransaction, Txid};
use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

pub struct RawTxEvent {
    pub tx: ParsedTransaction,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

pub struct RawTxAdapter {
    endpoint: String,
    circuit_breaker_threshold: u32,
    state: StateHandle,
    state_rx: watch::Receiver<AdapterState>,
}

impl RawTxAdapter {
    pub fn new(endpoint: String, circuit_breaker_threshold: u32) -> Self {
        let (state, state_rx) = StateHandle::new();
        Self {
            endpoint,
            circuit_breaker_threshold,
            state,
            state_rx,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state.get()
    }

    pub fn state_watch(&self) -> watch::Receiver<AdapterState> {
        self.state_rx.clone()
    }

    /// Start streaming. Returns a receiver of parsed transactions; the
    /// adapter task runs until `cancel` fires.
    pub fn start(
        &self,
        mut cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<RawTxEvent> {
        let (tx_out, rx_out) = mpsc::channel(4096);
        let endpoint = self.endpoint.clone();
        let state = self.state.clone();
        let threshold = self.circuit_breaker_threshold;

        tokio::spawn(async move {
            let mut backoff = Backoff::new(threshold);
            state.set(AdapterState::Reconnecting);

            loop {
                if *cancel.borrow() {
                    state.set(AdapterState::Disconnected);
                    return;
                }

                let (raw_tx, mut zmq_rx) = mpsc::channel::<Vec<u8>>(4096);
                let worker_endpoint = endpoint.clone();
                let worker_state = state.clone();

                let worker = tokio::task::spawn_blocking(move || {
                    run_zmq_worker(&worker_endpoint, raw_tx, worker_state)
                });

                state.set(AdapterState::Connected);
                backoff.reset();
                info!(component = "rawtx_adapter", endpoint = %endpoint, "connected");

                loop {
                    tokio::select! {
                        _ = cancel.changed() => {
                            if *cancel.borrow() {
                                worker.abort();
                                state.set(AdapterState::Disconnected);
                                return;
                            }
                        }
                        frame = zmq_rx.recv() => {
                            match frame {
                                Some(bytes) => {
                                    match parse_frame(&bytes) {
                                        Ok(tx) => {
                                            let event = RawTxEvent {
                                                tx,
                                                received_at: chrono::Utc::now(),
                                            };
                                            if tx_out.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            warn!(component = "rawtx_adapter", error = %e, "malformed frame discarded");
                                        }
                                    }
                                }
                                None => {
                                    warn!(component = "rawtx_adapter", "zmq worker exited, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }

                state.set(AdapterState::Reconnecting);
                match backoff.next_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        error!(component = "rawtx_adapter", "circuit breaker tripped, entering FAILED");
                        state.set(AdapterState::Failed);
                        return;
                    }
                }
            }
        });

        rx_out
    }
}

fn run_zmq_worker(endpoint: &str, out: mpsc::Sender<Vec<u8>>, state: StateHandle) {
    let ctx = zmq::Context::new();
    let socket = match ctx.socket(zmq::SUB) {
        Ok(s) => s,
        Err(e) => {
            error!(component = "rawtx_adapter", error = %e, "failed to create zmq socket");
            return;
        }
    };
    if let Err(e) = socket.connect(endpoint) {
        error!(component = "rawtx_adapter", error = %e, endpoint, "zmq connect failed");
        return;
    }
    if let Err(e) = socket.set_subscribe(b"rawtx") {
        error!(component = "rawtx_adapter", error = %e, "zmq subscribe failed");
        return;
    }
    socket.set_rcvtimeo(1000).ok();

    loop {
        match socket.recv_multipart(0) {
            Ok(parts) if parts.len() >= 2 => {
                if out.blocking_send(parts[1].clone()).is_err() {
                    return;
                }
            }
            Ok(_) => continue,
            Err(zmq::Error::EAGAIN) => {
                if out.is_closed() {
                    return;
                }
                continue;
            }
            Err(e) => {
                warn!(component = "rawtx_adapter", error = %e, "zmq recv error");
                let _ = state;
                return;
            }
        }
    }
}

fn parse_frame(bytes: &[u8]) -> Result<ParsedTransaction, OracleError> {
    let tx: Transaction =
        deserialize(bytes).map_err(|e| OracleError::SourceProtocolError(e.to_string()))?;

    let total_output_sats: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    let rbf_enabled = tx.input.iter().any(|i| i.sequence.0 < 0xFFFFFFFE);
    let vsize_vbytes = tx.vsize() as u64;
    let txid: Txid = tx.compute_txid();

    Ok(ParsedTransaction {
        txid,
        first_seen_at: Instant::now(),
        total_output_sats,
        // Fee is unknown without the prevout set; a raw rawtx ZMQ frame
        // carries no previous-output values and resolving them would mean
        // a per-tx RPC round trip on this hot path. feeRate is 0 until a
        // separate enrichment path exists (documented gap in DESIGN.md).
        fee_sats: 0,
        vsize_vbytes,
        rbf_enabled,
        input_addresses: None,
        output_addresses: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_frame_is_rejected_not_panicking() {
        let result = parse_frame(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(result.is_err());
    }
}
