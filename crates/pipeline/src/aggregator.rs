//! Running price statistics over successfully processed orders.
//!
//! All four figures (count, sum, min, max) live in one struct behind one mutex, so a
//! reader never sees a sum that includes an addition whose min/max update is still
//! pending. The average is derived from the exact integer sum on every read.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::info;

use orderflow_core::Price;

/// Default number of additions between periodic statistics reports.
const DEFAULT_REPORT_EVERY: u64 = 10;

#[derive(Debug, Default, Clone, Copy)]
struct PriceTotals {
    count: u64,
    sum_cents: u128,
    min: Option<Price>,
    max: Option<Price>,
}

impl PriceTotals {
    fn record(&mut self, price: Price) {
        self.count += 1;
        self.sum_cents += u128::from(price.cents());
        self.min = Some(self.min.map_or(price, |m| m.min(price)));
        self.max = Some(self.max.map_or(price, |m| m.max(price)));
    }

    fn snapshot(&self) -> PriceSnapshot {
        let average = if self.count == 0 {
            None
        } else {
            Some(self.sum_cents as f64 / (self.count as f64 * Price::SCALE as f64))
        };
        PriceSnapshot {
            count: self.count,
            sum_cents: self.sum_cents,
            average,
            min: self.min,
            max: self.max,
        }
    }
}

/// Consistent view of the statistics at one point in time.
///
/// `average`, `min` and `max` are `None` until the first price is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSnapshot {
    pub count: u64,
    pub sum_cents: u128,
    pub average: Option<f64>,
    pub min: Option<Price>,
    pub max: Option<Price>,
}

/// Thread-safe price aggregator shared by every dispatcher worker.
#[derive(Debug)]
pub struct PriceAggregator {
    totals: Mutex<PriceTotals>,
    report_every: u64,
}

impl PriceAggregator {
    pub fn new() -> Self {
        Self::with_report_every(DEFAULT_REPORT_EVERY)
    }

    /// Report statistics every `report_every` additions (0 is treated as 1).
    pub fn with_report_every(report_every: u64) -> Self {
        Self {
            totals: Mutex::new(PriceTotals::default()),
            report_every: report_every.max(1),
        }
    }

    // Aggregation must never fail; a panic in another holder leaves the totals intact.
    fn lock(&self) -> MutexGuard<'_, PriceTotals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one successful price and return the statistics including it.
    pub fn add_price(&self, price: Price) -> PriceSnapshot {
        let snapshot = {
            let mut totals = self.lock();
            totals.record(price);
            totals.snapshot()
        };

        if snapshot.count % self.report_every == 0 {
            log_statistics("price statistics", &snapshot);
        }

        snapshot
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        self.lock().snapshot()
    }

    /// Log the final statistics (at shutdown) and return them.
    pub fn log_final_statistics(&self) -> PriceSnapshot {
        let snapshot = self.snapshot();
        log_statistics("final price statistics", &snapshot);
        snapshot
    }
}

impl Default for PriceAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn log_statistics(label: &'static str, s: &PriceSnapshot) {
    let average = s.average.map_or_else(|| "-".to_string(), |a| format!("{a:.2}"));
    let min = s.min.map_or_else(|| "-".to_string(), |p| p.to_string());
    let max = s.max.map_or_else(|| "-".to_string(), |p| p.to_string());
    info!(
        orders_processed = s.count,
        average = %average,
        min = %min,
        max = %max,
        "{label}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn cents(c: u64) -> Price {
        Price::from_cents(c).unwrap()
    }

    #[test]
    fn empty_aggregator_has_no_bounds() {
        let agg = PriceAggregator::new();
        let s = agg.snapshot();
        assert_eq!(s.count, 0);
        assert_eq!(s.sum_cents, 0);
        assert_eq!(s.average, None);
        assert_eq!(s.min, None);
        assert_eq!(s.max, None);
    }

    #[test]
    fn tracks_count_average_and_bounds() {
        let agg = PriceAggregator::new();
        agg.add_price(cents(1_000));
        agg.add_price(cents(250));
        let s = agg.add_price(cents(4_000));

        assert_eq!(s.count, 3);
        assert_eq!(s.sum_cents, 5_250);
        assert_eq!(s.average, Some(17.5));
        assert_eq!(s.min, Some(cents(250)));
        assert_eq!(s.max, Some(cents(4_000)));
        assert_eq!(agg.snapshot(), s);
    }

    #[test]
    fn sum_is_exact_over_many_small_additions() {
        let agg = PriceAggregator::with_report_every(u64::MAX);
        for _ in 0..100_000 {
            agg.add_price(cents(1));
        }
        let s = agg.snapshot();
        assert_eq!(s.sum_cents, 100_000);
        assert_eq!(s.average, Some(0.01));
    }

    #[test]
    fn concurrent_additions_from_eight_workers() {
        let agg = Arc::new(PriceAggregator::with_report_every(1_000));
        let handles: Vec<_> = (0..8u64)
            .map(|w| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        agg.add_price(cents(w * 1_000 + i + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Values are exactly 1..=8000 cents.
        let s = agg.snapshot();
        assert_eq!(s.count, 8_000);
        assert_eq!(s.sum_cents, 8_000 * 8_001 / 2);
        assert_eq!(s.min, Some(cents(1)));
        assert_eq!(s.max, Some(cents(8_000)));
        assert_eq!(s.average, Some(40.005));
    }

    #[test]
    fn concurrent_readers_never_see_partial_updates() {
        let agg = Arc::new(PriceAggregator::with_report_every(u64::MAX));
        let writer = {
            let agg = Arc::clone(&agg);
            std::thread::spawn(move || {
                for i in 1..=5_000u64 {
                    agg.add_price(cents(i));
                }
            })
        };

        for _ in 0..2_000 {
            let s = agg.snapshot();
            if s.count > 0 {
                // Writer adds 1, 2, 3, ... so after n additions max == n and sum == n(n+1)/2.
                assert_eq!(s.max, Some(cents(s.count)));
                assert_eq!(s.min, Some(cents(1)));
                assert_eq!(s.sum_cents, u128::from(s.count) * u128::from(s.count + 1) / 2);
            }
        }
        writer.join().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: after every addition, the average equals exact_sum / count and
        /// min/max equal the true bounds of the prefix.
        #[test]
        fn every_prefix_matches_exact_statistics(
            values in prop::collection::vec(1u64..10_000_000u64, 1..200)
        ) {
            let agg = PriceAggregator::with_report_every(u64::MAX);
            let mut sum: u128 = 0;
            let mut lo = u64::MAX;
            let mut hi = 0u64;

            for (n, v) in values.iter().enumerate() {
                let s = agg.add_price(cents(*v));
                sum += u128::from(*v);
                lo = lo.min(*v);
                hi = hi.max(*v);
                let count = (n + 1) as u64;

                prop_assert_eq!(s.count, count);
                prop_assert_eq!(s.sum_cents, sum);
                prop_assert_eq!(s.min, Some(cents(lo)));
                prop_assert_eq!(s.max, Some(cents(hi)));

                let expected = sum as f64 / (count as f64 * 100.0);
                let average = s.average.unwrap();
                prop_assert!((average - expected).abs() <= 1e-9 * expected.max(1.0));
            }
        }
    }
}
