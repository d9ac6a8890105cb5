//! Raw-block feed adapter (§4.1, §6): subscribes to a Bitcoin node's
//! ZMQ `rawblock` publisher and yields the list of confirmed txids
//! plus height for each new block. Shares the reconnect/backoff shape
//! of `rawtx`.

use super::{AdapterState, Backoff, StateHandle};
use crate::error::OracleError;
use bitcoin::consensus::encode::deserialize;
use bitcoin::Block;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

pub struct RawBlockEvent {
    pub height: u64,
    pub txids: Vec<bitcoin::Txid>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

pub struct RawBlockAdapter {
    endpoint: String,
    circuit_breaker_threshold: u32,
    state: StateHandle,
    state_rx: watch::Receiver<AdapterState>,
}

impl RawBlockAdapter {
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

    /// `current_height` resolves the block's height since ZMQ's
    /// `rawblock` frame carries no height field; the caller supplies a
    /// tip tracker (typically fed by the RPC adapter) used to derive
    /// `prev_height + 1` for each arriving block.
    pub fn start(
        &self,
        mut cancel: watch::Receiver<bool>,
        mut tip_height: u64,
    ) -> mpsc::Receiver<RawBlockEvent> {
        let (tx_out, rx_out) = mpsc::channel(256);
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

                let (raw_tx, mut zmq_rx) = mpsc::channel::<Vec<u8>>(64);
                let worker_endpoint = endpoint.clone();

                let worker = tokio::task::spawn_blocking(move || run_zmq_worker(&worker_endpoint, raw_tx));

                state.set(AdapterState::Connected);
                backoff.reset();
                info!(component = "rawblock_adapter", endpoint = %endpoint, "connected");

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
                                Some(bytes) => match parse_frame(&bytes) {
                                    Ok(block) => {
                                        tip_height += 1;
                                        let event = RawBlockEvent {
                                            height: tip_height,
                                            txids: block.txdata.iter().map(|t| t.compute_txid()).collect(),
                                            received_at: chrono::Utc::now(),
                                        };
                                        if tx_out.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(component = "rawblock_adapter", error = %e, "malformed block frame discarded");
                                    }
                                },
                                None => {
                                    warn!(component = "rawblock_adapter", "zmq worker exited, reconnecting");
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
                        error!(component = "rawblock_adapter", "circuit breaker tripped, entering FAILED");
                        state.set(AdapterState::Failed);
                        return;
                    }
                }
            }
        });

        rx_out
    }
}

fn run_zmq_worker(endpoint: &str, out: mpsc::Sender<Vec<u8>>) {
    let ctx = zmq::Context::new();
    let socket = match ctx.socket(zmq::SUB) {
        Ok(s) => s,
        Err(e) => {
            error!(component = "rawblock_adapter", error = %e, "failed to create zmq socket");
            return;
        }
    };
    if let Err(e) = socket.connect(endpoint) {
        error!(component = "rawblock_adapter", error = %e, endpoint, "zmq connect failed");
        return;
    }
    if let Err(e) = socket.set_subscribe(b"rawblock") {
        error!(component = "rawblock_adapter", error = %e, "zmq subscribe failed");
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
                warn!(component = "rawblock_adapter", error = %e, "zmq recv error");
                return;
            }
        }
    }
}

fn parse_frame(bytes: &[u8]) -> Result<Block, OracleError> {
    deserialize(bytes).map_err(|e| OracleError::SourceProtocolError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_block_frame_is_rejected() {
        assert!(parse_frame(&[1, 2, 3]).is_err());
    }
}
