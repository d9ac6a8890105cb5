//! Whale Classifier (§4.3): a pure, stateless function over a parsed
//! transaction and a classification config. Produces a `WhaleCandidate`
//! when the transaction moves enough value, or when it touches a
//! labelled exchange address.

use crate::models::{Direction, FlowType, ParsedTransaction, WhaleCandidate};
use std::collections::HashSet;

/// Labelled address sets, loaded once at startup and shared read-only
/// thereafter (§5 "shared resources").
#[derive(Debug, Default, Clone)]
pub struct AddressBook {
    exchange: HashSet<String>,
}

impl AddressBook {
    pub fn new(exchange_addresses: impl IntoIterator<Item = String>) -> Self {
        Self {
            exchange: exchange_addresses.into_iter().collect(),
        }
    }

    pub fn is_exchange(&self, address: &str) -> bool {
        self.exchange.contains(address)
    }

    pub fn len(&self) -> usize {
        self.exchange.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchange.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    pub whale_threshold_btc: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            whale_threshold_btc: 100.0,
        }
    }
}

/// Sum of sats received by addresses that appear in `book`. `None`
/// when the address list itself is unavailable (§4.3
/// `InsufficientInputData` degrades rather than errors).
fn exchange_weighted_sum(book: &AddressBook, addresses: Option<&[String]>, per_address_sats: u64) -> Option<u64> {
    let addresses = addresses?;
    Some(
        addresses
            .iter()
            .filter(|a| book.is_exchange(a))
            .map(|_| per_address_sats)
            .sum(),
    )
}

/// Pure classification: `classify(tx) == classify(tx)` for any fixed
/// `(book, config)` (§8 idempotence law).
pub fn classify(
    tx: &ParsedTransaction,
    book: &AddressBook,
    config: &ClassificationConfig,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<WhaleCandidate> {
    let btc_value = tx.btc_value();
    let threshold_sats = (config.whale_threshold_btc * 100_000_000.0) as u64;

    // Approximate per-address share; exact distribution isn't available
    // without per-output amounts, so spread evenly across named
    // addresses on each side. This is sufficient to decide direction —
    // the pipeline never needs exact per-address accounting.
    let output_count = tx.output_addresses.as_ref().map(|v| v.len()).unwrap_or(0).max(1) as u64;
    let input_count = tx.input_addresses.as_ref().map(|v| v.len()).unwrap_or(0).max(1) as u64;

    let inflow_sats = exchange_weighted_sum(
        book,
        tx.output_addresses.as_deref(),
        tx.total_output_sats / output_count,
    );
    let outflow_sats = exchange_weighted_sum(
        book,
        tx.input_addresses.as_deref(),
        tx.total_output_sats / input_count,
    );

    let touches_exchange =
        inflow_sats.unwrap_or(0) >= threshold_sats || outflow_sats.unwrap_or(0) >= threshold_sats;
    let is_whale = tx.total_output_sats >= threshold_sats || touches_exchange;

    if !is_whale {
        return None;
    }

    // Either side may be unresolved (§4.3's input-address-lookup caveat);
    // an unresolved side contributes zero rather than blocking the
    // comparison, so a transaction with only output-address data still
    // classifies by whichever side actually resolved.
    let inflow = inflow_sats.unwrap_or(0);
    let outflow = outflow_sats.unwrap_or(0);
    let direction = if inflow_sats.is_none() && outflow_sats.is_none() {
        Direction::Neutral
    } else if inflow > outflow {
        Direction::In
    } else if outflow > inflow {
        Direction::Out
    } else {
        Direction::Neutral
    };

    // Degrades to WHALE_TRANSFER when input/output address data is
    // unresolvable rather than erroring the pipeline (§4.3).
    let inputs_resolved = tx.input_addresses.is_some();
    let flow_type = if !inputs_resolved && inflow_sats.is_none() {
        FlowType::WhaleTransfer
    } else {
        match direction {
            Direction::In => FlowType::ExchangeInflow,
            Direction::Out => FlowType::ExchangeOutflow,
            Direction::Neutral if touches_exchange => FlowType::Unknown,
            Direction::Neutral => FlowType::WhaleTransfer,
        }
    };

    Some(WhaleCandidate {
        txid: tx.txid,
        btc_value,
        direction,
        flow_type,
        detected_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::time::Instant;

    fn base_tx(total_output_sats: u64) -> ParsedTransaction {
        ParsedTransaction {
            txid: bitcoin::Txid::from_byte_array([7u8; 32]),
            first_seen_at: Instant::now(),
            total_output_sats,
            fee_sats: 5_000,
            vsize_vbytes: 200,
            rbf_enabled: false,
            input_addresses: None,
            output_addresses: None,
        }
    }

    #[test]
    fn below_threshold_and_no_exchange_is_not_a_whale() {
        let tx = base_tx(1_000_000); // 0.01 BTC
        let book = AddressBook::default();
        let result = classify(&tx, &book, &ClassificationConfig::default(), chrono::Utc::now());
        assert!(result.is_none());
    }

    #[test]
    fn above_threshold_is_a_whale_transfer() {
        let tx = base_tx(20_000_000_000); // 200 BTC, matches S1
        let book = AddressBook::default();
        let candidate =
            classify(&tx, &book, &ClassificationConfig::default(), chrono::Utc::now()).unwrap();
        assert_eq!(candidate.btc_value, 200.0);
        assert_eq!(candidate.direction, Direction::Neutral);
        assert_eq!(candidate.flow_type, FlowType::WhaleTransfer);
    }

    #[test]
    fn exchange_outputs_classify_as_inflow() {
        // 200 BTC, all of it landing on a single labelled exchange
        // output address; no input-address data resolved at all.
        let mut tx = base_tx(20_000_000_000);
        tx.output_addresses = Some(vec!["exchange1".to_string()]);
        let book = AddressBook::new(["exchange1".to_string()]);
        let candidate =
            classify(&tx, &book, &ClassificationConfig::default(), chrono::Utc::now()).unwrap();
        assert_eq!(candidate.direction, Direction::In);
        assert_eq!(candidate.flow_type, FlowType::ExchangeInflow);
    }

    #[test]
    fn sub_threshold_exchange_inflow_is_not_a_whale() {
        let mut tx = base_tx(500_000_000); // 5 BTC, below whale threshold
        tx.output_addresses = Some(vec!["exchange1".to_string()]);
        let book = AddressBook::new(["exchange1".to_string()]);
        let result = classify(&tx, &book, &ClassificationConfig::default(), chrono::Utc::now());
        assert!(result.is_none());
    }

    #[test]
    fn classification_is_pure() {
        let tx = base_tx(20_000_000_000);
        let book = AddressBook::default();
        let config = ClassificationConfig::default();
        let now = chrono::Utc::now();
        let a = classify(&tx, &book, &config, now);
        let b = classify(&tx, &book, &config, now);
        assert_eq!(a.map(|c| c.flow_type), b.map(|c| c.flow_type));
    }
}
