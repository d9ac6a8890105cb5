//! Price Aggregator (§4.5): the UTXOracle rolling histogram model.
//! Single-threaded by construction — the struct is driven by exactly
//! one owning task (§5) and never shares state across tasks.

use crate::models::PriceEstimate;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Wall-clock age bound for the rolling window (default 3h).
    pub window_max_age: Duration,
    /// Entry-count cap on the rolling window.
    pub window_max_entries: usize,
    pub min_samples: usize,
    pub min_emit_confidence: f64,
    pub emit_delta_rel: f64,
    pub max_search_iterations: u32,
    pub max_step_rel: f64,
    /// Log-histogram bin width, in natural-log space.
    pub bin_width: f64,
    /// Initial price guess before any ticks have converged.
    pub initial_price_guess: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_max_age: Duration::from_secs(3 * 3600),
            window_max_entries: 2_000_000,
            min_samples: 1000,
            min_emit_confidence: 0.8,
            emit_delta_rel: 0.002,
            max_search_iterations: 6,
            max_step_rel: 0.05,
            bin_width: 0.05,
            initial_price_guess: 50_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Output {
    sats: u64,
    seen_at: Instant,
}

/// Round-number USD amounts that real exchange-derived payments
/// disproportionately cluster on (§4.5 step 3, open question #1 in
/// spec.md §9 — the exact scattered rule set from the batch reference
/// reduces to: exact multiples of the listed round numbers, checked
/// against the output's USD value under the current price guess).
const ROUND_NUMBER_USD: &[f64] = &[
    1.0, 5.0, 10.0, 20.0, 25.0, 50.0, 100.0, 200.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10_000.0,
];
const ROUND_NUMBER_REL_TOLERANCE: f64 = 0.002;
const ROUND_NUMBER_DOWNWEIGHT: f64 = 0.2;

fn round_number_weight(usd_value: f64) -> f64 {
    if usd_value <= 0.0 {
        return 1.0;
    }
    for &round in ROUND_NUMBER_USD {
        if (usd_value - round).abs() / round <= ROUND_NUMBER_REL_TOLERANCE {
            return ROUND_NUMBER_DOWNWEIGHT;
        }
    }
    1.0
}

/// A log-spaced histogram over USD-denominated output values,
/// reprojected at a candidate price `p` on demand (§4.5 step 2).
struct Histogram {
    bin_width: f64,
    bins: Vec<f64>,
    min_bin: i64,
}

impl Histogram {
    fn build(outputs: &[Output], price: f64, bin_width: f64) -> Self {
        let mut weighted: Vec<(i64, f64)> = Vec::with_capacity(outputs.len());
        let mut min_bin = i64::MAX;
        let mut max_bin = i64::MIN;

        for o in outputs {
            let usd = o.sats as f64 / 100_000_000.0 * price;
            if usd <= 0.0 {
                continue;
            }
            let bin = (usd.ln() / bin_width).floor() as i64;
            let weight = round_number_weight(usd);
            weighted.push((bin, weight));
            min_bin = min_bin.min(bin);
            max_bin = max_bin.max(bin);
        }

        if weighted.is_empty() {
            return Self {
                bin_width,
                bins: Vec::new(),
                min_bin: 0,
            };
        }

        let span = (max_bin - min_bin + 1) as usize;
        let mut bins = vec![0.0f64; span];
        for (bin, weight) in weighted {
            bins[(bin - min_bin) as usize] += weight;
        }

        Self {
            bin_width,
            bins,
            min_bin,
        }
    }

    fn total_weight(&self) -> f64 {
        self.bins.iter().sum()
    }
}

/// A reference distribution of legitimate USD payment volume, used to
/// score how well a candidate price's reprojected histogram matches
/// genuine payment behaviour (§4.5 step 4). Modelled as a smooth
/// log-normal bump centred near typical small-payment USD amounts,
/// which is what the batch reference's stencil approximates (spec.md
/// §9 open question #2 — the exact stencil shape is
/// implementation-defined; this one preserves the documented
/// equivalence contract: a clean log-normal cluster at the true price
/// scores highest when the candidate equals that price).
struct Stencil {
    center_bin: f64,
    sigma_bins: f64,
}

impl Stencil {
    fn new(bin_width: f64) -> Self {
        // Centred around a $100-equivalent bin, with a few bins of spread,
        // matching where genuine retail-scale payments cluster.
        Self {
            center_bin: (100.0f64.ln()) / bin_width,
            sigma_bins: 1.5 / bin_width,
        }
    }

    /// Score in `[0,1]`: the weight-average of the stencil's Gaussian
    /// envelope across `hist`'s populated bins. A reprojection that
    /// lands its mass near `center_bin` scores close to 1; one that
    /// scatters it into the tails scores low. Unlike a capacity-capped
    /// overlap, this doesn't depend on the histogram's bin span, so a
    /// single concentrated cluster isn't trivially "uncapped" into a
    /// perfect score regardless of where it actually sits.
    fn score(&self, hist: &Histogram) -> f64 {
        let total = hist.total_weight();
        if total <= 0.0 {
            return 0.0;
        }
        let mut weighted = 0.0;
        for (i, &w) in hist.bins.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            let bin = (hist.min_bin + i as i64) as f64;
            let z = (bin - self.center_bin) / self.sigma_bins;
            let expected = (-0.5 * z * z).exp();
            weighted += w * expected;
        }
        (weighted / total).clamp(0.0, 1.0)
    }
}

pub struct PriceAggregator {
    config: AggregatorConfig,
    window: VecDeque<Output>,
    price_guess: f64,
    last_tick_id: u64,
    last_emitted_price: Option<f64>,
    last_emitted_confidence: f64,
}

impl PriceAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let price_guess = config.initial_price_guess;
        Self {
            config,
            window: VecDeque::new(),
            price_guess,
            last_tick_id: 0,
            last_emitted_price: None,
            last_emitted_confidence: 0.0,
        }
    }

    pub fn price_guess(&self) -> f64 {
        self.price_guess
    }

    pub fn sample_size(&self) -> usize {
        self.window.len()
    }

    /// Feed a new output's satoshi value. Called as transactions
    /// arrive; does not itself run a tick.
    pub fn record_output(&mut self, sats: u64) {
        self.window.push_back(Output {
            sats,
            seen_at: Instant::now(),
        });
        if self.window.len() > self.config.window_max_entries {
            self.window.pop_front();
        }
    }

    /// Remove the contribution of an evicted cache entry. Because the
    /// rolling window only tracks raw sat values (not txids), eviction
    /// from the Cache is handled by the window's own age/size bounds —
    /// this is a no-op retained for interface symmetry with §4.2's
    /// eviction callback contract.
    pub fn forget_output(&mut self, _sats: u64) {}

    fn evict_expired(&mut self) {
        let cutoff = Instant::now()
            .checked_sub(self.config.window_max_age)
            .unwrap_or_else(Instant::now);
        while let Some(front) = self.window.front() {
            if front.seen_at < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while self.window.len() > self.config.window_max_entries {
            self.window.pop_front();
        }
    }

    /// Run one tick (§4.5 steps 1-7). Returns `Some(PriceEstimate)`
    /// when the emission criteria are met; a single-tick failure (e.g.
    /// degenerate histogram) preserves the previous estimate and
    /// returns `None` without panicking.
    pub fn tick(&mut self, wall_time: chrono::DateTime<chrono::Utc>) -> Option<PriceEstimate> {
        self.evict_expired();

        let sample_size = self.window.len();
        if sample_size == 0 {
            return self.maybe_emit(0.0, 0, wall_time, None);
        }

        let outputs: Vec<Output> = self.window.iter().copied().collect();
        let stencil = Stencil::new(self.config.bin_width);

        let best = self.search_best_price(&outputs, &stencil);
        let Some((p_star, match_score)) = best else {
            warn!(component = "price_aggregator", "degenerate histogram, tick skipped");
            return None;
        };

        // Convergence smoothing: stronger match -> larger alpha.
        let alpha = (0.15 + 0.5 * match_score).min(0.65);
        let mut price_out = (1.0 - alpha) * self.price_guess + alpha * p_star;

        // Clamp movement to maxStep relative to the previous guess.
        let max_step = self.price_guess * self.config.max_step_rel;
        let delta = price_out - self.price_guess;
        if delta.abs() > max_step {
            price_out = self.price_guess + max_step.copysign(delta);
        }

        self.price_guess = price_out;

        let recency_density = self.recency_density();
        let confidence = self.confidence(match_score, sample_size, recency_density);

        debug!(
            component = "price_aggregator",
            price = price_out,
            confidence,
            sample_size,
            "tick computed"
        );

        self.maybe_emit(confidence, sample_size, wall_time, Some(price_out))
    }

    fn search_best_price(&self, outputs: &[Output], stencil: &Stencil) -> Option<(f64, f64)> {
        let base = self.price_guess;
        if base <= 0.0 {
            return None;
        }

        let mut lo_mult = 0.8f64;
        let mut hi_mult = 1.25f64;
        let mut best: Option<(f64, f64)> = None;

        for _ in 0..self.config.max_search_iterations {
            let steps = 24;
            let log_lo = lo_mult.ln();
            let log_hi = hi_mult.ln();
            let mut iteration_best: Option<(f64, f64)> = None;

            for i in 0..=steps {
                let t = i as f64 / steps as f64;
                let mult = (log_lo + t * (log_hi - log_lo)).exp();
                let candidate_price = base * mult;
                let hist = Histogram::build(outputs, candidate_price, self.config.bin_width);
                if hist.bins.is_empty() {
                    continue;
                }
                let score = stencil.score(&hist);
                if iteration_best.map(|(_, s)| score > s).unwrap_or(true) {
                    iteration_best = Some((candidate_price, score));
                }
            }

            let Some((cand_price, cand_score)) = iteration_best else {
                return best;
            };

            let at_edge = {
                let mult = cand_price / base;
                (mult - lo_mult).abs() < 1e-9 || (mult - hi_mult).abs() < 1e-9
            };

            if best.map(|(_, s)| cand_score > s).unwrap_or(true) {
                best = Some((cand_price, cand_score));
            }

            if !at_edge {
                break;
            }

            // Widen one step and retry, per §4.5 step 5.
            lo_mult *= 0.9;
            hi_mult *= 1.1;
        }

        best
    }

    /// Fraction of the window newer than half the max age — a crude
    /// recency-density signal feeding confidence.
    fn recency_density(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let half_age = self.config.window_max_age / 2;
        let cutoff = Instant::now()
            .checked_sub(half_age)
            .unwrap_or_else(Instant::now);
        let recent = self.window.iter().filter(|o| o.seen_at >= cutoff).count();
        recent as f64 / self.window.len() as f64
    }

    fn confidence(&self, match_score: f64, sample_size: usize, recency_density: f64) -> f64 {
        if sample_size < self.config.min_samples {
            return 0.0;
        }
        let size_factor = (sample_size as f64 / (self.config.min_samples as f64 * 4.0)).min(1.0);
        (0.6 * match_score + 0.25 * size_factor + 0.15 * recency_density).clamp(0.0, 1.0)
    }

    fn maybe_emit(
        &mut self,
        confidence: f64,
        sample_size: usize,
        wall_time: chrono::DateTime<chrono::Utc>,
        computed_price: Option<f64>,
    ) -> Option<PriceEstimate> {
        let price = computed_price.unwrap_or(self.price_guess);

        let delta_rel = match self.last_emitted_price {
            Some(prev) if prev > 0.0 => ((price - prev) / prev).abs(),
            _ => f64::INFINITY,
        };

        let should_emit =
            confidence >= self.config.min_emit_confidence || delta_rel >= self.config.emit_delta_rel;

        if !should_emit {
            return None;
        }

        self.last_tick_id += 1;
        self.last_emitted_price = Some(price);
        self.last_emitted_confidence = confidence;

        Some(PriceEstimate {
            tick_id: self.last_tick_id,
            wall_time,
            price_usd: price,
            confidence,
            sample_size,
            histogram_digest: format!("{:x}", sample_size as u64 ^ (price.to_bits())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Distribution;
    use rand::SeedableRng;
    use rand_distr::Normal;

    /// Outputs clustered around a single typical payment size with
    /// log-normal noise, converted to sats via `true_price` (S2).
    fn synth_outputs(n: usize, true_price: f64, sigma: f64, seed: u64) -> Vec<u64> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, sigma).unwrap();
        let base_usd = 100.0;
        (0..n)
            .map(|_| {
                let noise = normal.sample(&mut rng);
                let usd = base_usd * noise.exp();
                ((usd / true_price) * 100_000_000.0).max(1.0) as u64
            })
            .collect()
    }

    #[test]
    fn empty_window_emits_zero_confidence() {
        let mut agg = PriceAggregator::new(AggregatorConfig::default());
        let estimate = agg.tick(chrono::Utc::now());
        // Zero-confidence ticks are only emitted if delta crosses the
        // threshold; on the very first tick there's no prior emission,
        // so this always emits (relative delta is infinite).
        let estimate = estimate.expect("first tick always emits");
        assert_eq!(estimate.confidence, 0.0);
        assert_eq!(estimate.sample_size, 0);
    }

    #[test]
    fn price_converges_near_synthetic_truth() {
        // S2: 2000 outputs synthesised from a known price of 50000 USD.
        let true_price = 50_000.0;
        let mut agg = PriceAggregator::new(AggregatorConfig {
            initial_price_guess: true_price, // search starts near truth, as a realistic warm pipeline would
            ..AggregatorConfig::default()
        });

        let outputs = synth_outputs(2000, true_price, 0.03, 42);
        for sats in &outputs {
            agg.record_output(*sats);
        }

        let mut last = None;
        for _ in 0..10 {
            if let Some(estimate) = agg.tick(chrono::Utc::now()) {
                last = Some(estimate);
            }
        }

        let estimate = last.expect("expected at least one emission within 10 ticks");
        assert!(
            estimate.price_usd >= 49_000.0 && estimate.price_usd <= 51_000.0,
            "price {} drifted too far from {}",
            estimate.price_usd,
            true_price
        );
        assert!(
            estimate.confidence >= 0.8,
            "confidence {} below the S2 acceptance threshold",
            estimate.confidence
        );
    }

    #[test]
    fn tick_id_is_strictly_monotone_across_emissions() {
        let mut agg = PriceAggregator::new(AggregatorConfig::default());
        let mut last_id = 0u64;
        for sats in synth_outputs(1500, 50_000.0, 0.02, 7) {
            agg.record_output(sats);
        }
        for _ in 0..5 {
            if let Some(e) = agg.tick(chrono::Utc::now()) {
                assert!(e.tick_id > last_id);
                last_id = e.tick_id;
            }
        }
    }

    #[test]
    fn round_number_outputs_are_downweighted() {
        assert!(round_number_weight(100.0) < 1.0);
        assert!((round_number_weight(137.42) - 1.0).abs() < f64::EPSILON);
    }
}
