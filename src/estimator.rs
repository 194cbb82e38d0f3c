use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed};

use crate::error::{GatewayError, Result};
use crate::query::Query;
use crate::types::BlockFees;

/// Fee estimation from decay-weighted per-block fee rate history.
///
/// Counters are plain atomics read under relaxed ordering: `estimate` never
/// takes a lock and tolerates observing a block update mid-flight. All
/// mutation (push/pop/initialize) happens strictly in chain order from the
/// sync thread.

pub const BUCKET_COUNT: usize = 283;

/// Confirmation horizons, in blocks.
pub const HORIZON_SMALL: usize = 12;
pub const HORIZON_MEDIUM: usize = 48;
pub const HORIZON_LARGE: usize = 1008;

/// Fee-rate bin sizing, sat/vbyte.
const MIN_RATE: f64 = 0.1;
const STEP: f64 = 1.05;

const CONFIDENCE_LOW: f64 = 0.60;
const CONFIDENCE_MID: f64 = 0.85;
const CONFIDENCE_HIGH: f64 = 0.95;

/// Failure sentinel, unachievable as a fee rate.
pub const NO_ESTIMATE: u64 = u64::MAX;

lazy_static! {
    /// Per-block decay; the bucket count doubles as the half life.
    static ref DECAY_RATE: f64 = 0.5f64.powf(1.0 / BUCKET_COUNT as f64);
    static ref GROWTH: f64 = STEP.ln();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EstimateMode {
    Basic,
    Geometric,
    Economical,
    Conservative,
}

impl FromStr for EstimateMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> std::result::Result<Self, GatewayError> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(EstimateMode::Basic),
            "geometric" => Ok(EstimateMode::Geometric),
            "economical" => Ok(EstimateMode::Economical),
            // bitcoind's default smart-fee mode
            "conservative" | "unset" | "" => Ok(EstimateMode::Conservative),
            _ => Err(GatewayError::InvalidArgument),
        }
    }
}

/// f64 bits in an AtomicU64. Single writer, any number of relaxed readers.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn zero() -> Self {
        AtomicF64(AtomicU64::new(0f64.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Relaxed)
    }

    /// Underflow clamps to zero.
    fn add_clamped(&self, term: f64) {
        self.store((self.load() + term).max(0.0));
    }

    fn scale(&self, factor: f64) {
        self.store(self.load() * factor);
    }
}

struct Bucket {
    /// Total scaled txs in this fee-rate bin.
    total: AtomicF64,
    /// confirmed[n]: scaled txs entered within the last n+1 accumulated blocks.
    confirmed: Box<[AtomicF64]>,
}

struct Band {
    horizon: usize,
    buckets: Vec<Bucket>,
}

impl Band {
    fn new(horizon: usize) -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| Bucket {
                total: AtomicF64::zero(),
                confirmed: (0..horizon).map(|_| AtomicF64::zero()).collect(),
            })
            .collect();
        Band { horizon, buckets }
    }

    fn decay(&self, factor: f64) {
        for bucket in &self.buckets {
            bucket.total.scale(factor);
            for counter in bucket.confirmed.iter() {
                counter.scale(factor);
            }
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.total.store(0.0);
            for counter in bucket.confirmed.iter() {
                counter.store(0.0);
            }
        }
    }
}

pub struct Estimator {
    small: Band,
    medium: Band,
    large: Band,
    /// Chain height of the most recent push.
    top_height: AtomicUsize,
}

impl Estimator {
    pub fn new() -> Self {
        Estimator {
            small: Band::new(HORIZON_SMALL),
            medium: Band::new(HORIZON_MEDIUM),
            large: Band::new(HORIZON_LARGE),
            top_height: AtomicUsize::new(0),
        }
    }

    pub fn top_height(&self) -> usize {
        self.top_height.load(Relaxed)
    }

    /// Fee estimation in satoshis per transaction virtual byte.
    /// Targets at or beyond the large horizon (and estimation failure)
    /// answer with the `NO_ESTIMATE` sentinel.
    pub fn estimate(&self, target: usize, mode: EstimateMode) -> u64 {
        // zero targets the next block, same as one
        let target = target.max(1);
        if target >= HORIZON_LARGE {
            return NO_ESTIMATE;
        }

        match mode {
            EstimateMode::Basic => self.compute(target, CONFIDENCE_HIGH, false),
            EstimateMode::Geometric => self.compute(target, CONFIDENCE_HIGH, true),
            EstimateMode::Economical | EstimateMode::Conservative => {
                let fee1 = self.compute(target / 2, CONFIDENCE_LOW, false);
                let fee2 = self.compute(target.min(1), CONFIDENCE_MID, false);
                let fee3 = self.compute((2 * target).min(HORIZON_LARGE), CONFIDENCE_HIGH, false);
                fee1.max(fee2).max(fee3)
            }
        }
    }

    /// Populate the accumulator from the latest `count` confirmed blocks.
    /// Each block enters at its age below the tip: its terms are scaled by
    /// `α^age` (standing in for the decay a live replay would have applied)
    /// and only `confirmed[a]` for `a >= age` is credited. Cancellation is
    /// honored between blocks and discards the partial state.
    pub fn initialize(&self, cancel: &AtomicBool, query: &Query, count: usize) -> Result<bool> {
        if count == 0 {
            return Ok(true);
        }

        let top = query.get_top_confirmed()? as usize;
        if count - 1 > top {
            return Ok(false);
        }

        let start = top - (count - 1);
        for height in start..=top {
            if cancel.load(Relaxed) {
                self.reset();
                return Ok(false);
            }
            let rates = query.get_block_fees_at(height as u32)?;
            if !self.update(&rates, top - height, true) {
                self.reset();
                return Ok(false);
            }
        }

        // align the accumulator height with the chain
        self.top_height.store(top, Relaxed);
        Ok(true)
    }

    /// Accumulate the block above the current top.
    pub fn push(&self, query: &Query) -> Result<bool> {
        let next = match self.top_height().checked_add(1) {
            Some(next) => next,
            None => return Ok(false),
        };
        let rates = query.get_block_fees_at(next as u32)?;
        Ok(self.push_rates(&rates, 0))
    }

    /// Back the top block out of the accumulator.
    pub fn pop(&self, query: &Query) -> Result<bool> {
        let top = self.top_height();
        if top == 0 {
            return Ok(false);
        }
        let rates = query.get_block_fees_at(top as u32)?;
        Ok(self.pop_rates(&rates, 0))
    }

    /// Blocks must be pushed in order (but independent of chain index).
    /// `age` is the depth the block enters at; a chain-tip push is 0.
    pub fn push_rates(&self, block: &BlockFees, age: usize) -> bool {
        self.decay(*DECAY_RATE);
        if !self.update(block, age, true) {
            return false;
        }
        self.top_height.fetch_add(1, Relaxed);
        true
    }

    /// Exact inverse of `push_rates` at the same `age`, modulo float
    /// rounding.
    pub fn pop_rates(&self, block: &BlockFees, age: usize) -> bool {
        let result = self.update(block, age, false);
        self.decay(1.0 / *DECAY_RATE);
        self.top_height.fetch_sub(1, Relaxed);
        result
    }

    fn bands(&self) -> [&Band; 3] {
        [&self.small, &self.medium, &self.large]
    }

    fn decay(&self, factor: f64) {
        for band in &self.bands() {
            band.decay(factor);
        }
    }

    fn reset(&self) {
        for band in &self.bands() {
            band.reset();
        }
        self.top_height.store(0, Relaxed);
    }

    /// Enter (or back out) one block's fee-rate set at `age`. Terms are
    /// scaled by `α^age` and the confirmed-by-target counters are only
    /// credited from the entry age onward; `total` always takes the full
    /// scaled term, even in bands whose horizon the age exceeds.
    fn update(&self, block: &BlockFees, age: usize, push: bool) -> bool {
        let mut counts = [0u32; BUCKET_COUNT];
        for tx in block {
            if tx.bytes == 0 {
                return false;
            }
            if tx.fee == 0 {
                continue;
            }
            let rate = tx.fee as f64 / f64::from(tx.bytes);
            if rate < MIN_RATE {
                continue;
            }
            // clamp overflow to the last bin
            let bin = ((rate / MIN_RATE).ln() / *GROWTH).floor() as usize;
            counts[bin.min(BUCKET_COUNT - 1)] += 1;
        }

        // at age zero the scale term is one
        let scale = DECAY_RATE.powi(age as i32);
        for band in &self.bands() {
            for (bin, count) in counts.iter().enumerate() {
                if *count == 0 {
                    continue;
                }
                let scaled = f64::from(*count) * scale;
                let term = if push { scaled } else { -scaled };
                let bucket = &band.buckets[bin];
                bucket.total.add_clamped(term);
                for counter in bucket.confirmed.iter().skip(age) {
                    counter.add_clamped(term);
                }
            }
        }
        true
    }

    /// Scan the bins top down, accumulating totals and confirmed-by-target
    /// counters; the first bin with an adequate sample whose confirmed share
    /// clears the confidence bar sets the estimate at its lower edge.
    fn compute(&self, target: usize, confidence: f64, geometric: bool) -> u64 {
        let band = if target < HORIZON_SMALL {
            &self.small
        } else if target < HORIZON_MEDIUM {
            &self.medium
        } else if target < HORIZON_LARGE {
            &self.large
        } else {
            return NO_ESTIMATE;
        };
        debug_assert!(target < band.horizon);

        let adequate = 2.0 * (target as f64 + 1.0);
        let mut total = 0.0;
        let mut part = 0.0;

        for bin in (0..BUCKET_COUNT).rev() {
            let bucket = &band.buckets[bin];
            total += bucket.total.load();
            part += bucket.confirmed[target].load();
            if total < adequate {
                continue;
            }

            let contribution = if geometric {
                (part / total).powi(target as i32)
            } else {
                part / total
            };
            if contribution > 1.0 - confidence {
                return (MIN_RATE * STEP.powi(bin as i32)).ceil() as u64;
            }
        }

        NO_ESTIMATE
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<f64> {
        let mut counters = Vec::new();
        for band in &self.bands() {
            for bucket in &band.buckets {
                counters.push(bucket.total.load());
                for counter in bucket.confirmed.iter() {
                    counters.push(counter.load());
                }
            }
        }
        counters
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxFeeRate;

    fn uniform_block(rate_sat_vb: u64, txs: u32) -> BlockFees {
        (0..txs)
            .map(|_| TxFeeRate {
                fee: rate_sat_vb * 250,
                bytes: 250,
            })
            .collect()
    }

    #[test]
    fn empty_accumulator_has_no_estimate() {
        let estimator = Estimator::new();
        assert_eq!(estimator.estimate(6, EstimateMode::Basic), NO_ESTIMATE);
    }

    #[test]
    fn rejects_targets_beyond_large_horizon() {
        let estimator = Estimator::new();
        assert_eq!(estimator.estimate(HORIZON_LARGE, EstimateMode::Basic), NO_ESTIMATE);
        assert_eq!(
            estimator.estimate(HORIZON_LARGE + 5, EstimateMode::Conservative),
            NO_ESTIMATE
        );
    }

    /// Load a uniform history the way `initialize` does: the oldest block
    /// at the deepest age, no global decay (the `α^age` entry scaling
    /// stands in for it).
    fn aged_uniform(estimator: &Estimator, rate: u64, blocks: usize) {
        for age in (0..blocks).rev() {
            assert!(estimator.update(&uniform_block(rate, 10), age, true));
        }
        estimator.top_height.store(blocks - 1, Relaxed);
    }

    #[test]
    fn uniform_history_estimates_the_uniform_rate() {
        let estimator = Estimator::new();
        for _ in 0..HORIZON_LARGE {
            assert!(estimator.push_rates(&uniform_block(10, 10), 0));
        }
        let estimate = estimator.estimate(6, EstimateMode::Basic);
        assert!((9..=11).contains(&estimate), "estimate: {}", estimate);

        // geometric agrees when the confirmed share is saturated
        let geometric = estimator.estimate(6, EstimateMode::Geometric);
        assert!((9..=11).contains(&geometric), "geometric: {}", geometric);
    }

    #[test]
    fn targets_discriminate_by_confirmation_age() {
        let estimator = Estimator::new();
        aged_uniform(&estimator, 10, HORIZON_LARGE);

        // almost none of the (decay-weighted) bucket mass entered within
        // two blocks of the tip, so a short target has no estimate yet
        assert_eq!(estimator.estimate(2, EstimateMode::Basic), NO_ESTIMATE);

        // at a 200 block target most of the retained history qualifies
        let far = estimator.estimate(200, EstimateMode::Basic);
        assert!((9..=11).contains(&far), "estimate: {}", far);
        assert_ne!(estimator.estimate(2, EstimateMode::Basic), far);
    }

    #[test]
    fn aged_entries_only_credit_their_confirmation_window() {
        let estimator = Estimator::new();
        // one block, 30 deep: beyond the small horizon, within the medium
        assert!(estimator.update(&uniform_block(10, 100), 30, true));
        estimator.top_height.store(30, Relaxed);

        // the small band carries its mass in total only, so no target there
        // ever clears the confidence bar
        assert_eq!(estimator.estimate(6, EstimateMode::Basic), NO_ESTIMATE);
        // a medium target past the entry age sees the mass as confirmed
        let reachable = estimator.estimate(40, EstimateMode::Basic);
        assert!((9..=11).contains(&reachable), "estimate: {}", reachable);
    }

    #[test]
    fn zero_target_behaves_like_next_block() {
        let estimator = Estimator::new();
        for _ in 0..100 {
            estimator.push_rates(&uniform_block(50, 8), 0);
        }
        assert_eq!(
            estimator.estimate(0, EstimateMode::Basic),
            estimator.estimate(1, EstimateMode::Basic)
        );
    }

    #[test]
    fn conservative_takes_the_max_of_its_legs() {
        let estimator = Estimator::new();
        for _ in 0..200 {
            estimator.push_rates(&uniform_block(20, 10), 0);
        }
        let basic = estimator.estimate(6, EstimateMode::Basic);
        let conservative = estimator.estimate(6, EstimateMode::Conservative);
        assert!(conservative >= basic || conservative == NO_ESTIMATE);
    }

    #[test]
    fn pop_inverts_push_within_tolerance() {
        let estimator = Estimator::new();
        for height in 0..50u64 {
            estimator.push_rates(&uniform_block(5 + height % 40, 6), 0);
        }
        let before = estimator.snapshot();
        let top_before = estimator.top_height();

        let block = uniform_block(33, 12);
        assert!(estimator.push_rates(&block, 0));
        assert!(estimator.pop_rates(&block, 0));

        // aged pairs invert too
        let stale = uniform_block(17, 4);
        assert!(estimator.push_rates(&stale, 5));
        assert!(estimator.pop_rates(&stale, 5));

        assert_eq!(estimator.top_height(), top_before);
        for (before, after) in before.iter().zip(estimator.snapshot()) {
            let magnitude = before.abs().max(1.0);
            assert!(
                (before - after).abs() < 1e-9 * magnitude,
                "counter drifted: {} -> {}",
                before,
                after
            );
        }
    }

    #[test]
    fn zero_byte_transactions_poison_the_block() {
        let estimator = Estimator::new();
        let bad = vec![TxFeeRate { fee: 100, bytes: 0 }];
        assert!(!estimator.push_rates(&bad, 0));
    }

    #[test]
    fn zero_fee_and_dust_rates_are_skipped() {
        let estimator = Estimator::new();
        let block = vec![
            TxFeeRate { fee: 0, bytes: 250 },
            TxFeeRate { fee: 1, bytes: 1000 }, // 0.001 sat/vb, below the first bin
        ];
        assert!(estimator.push_rates(&block, 0));
        assert_eq!(estimator.estimate(6, EstimateMode::Basic), NO_ESTIMATE);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("basic".parse::<EstimateMode>().unwrap(), EstimateMode::Basic);
        assert_eq!(
            "ECONOMICAL".parse::<EstimateMode>().unwrap(),
            EstimateMode::Economical
        );
        assert_eq!(
            "unset".parse::<EstimateMode>().unwrap(),
            EstimateMode::Conservative
        );
        assert!("bogus".parse::<EstimateMode>().is_err());
    }
}
