//! Rolling liquidation clusters
//!
//! Fills are bucketed by price; each bucket's notional decays exponentially
//! with age. Short liquidations above price pull a long setup, long
//! liquidations below price pull a short setup.

use std::collections::{BTreeMap, VecDeque};

use crate::config::Layer0Config;
use crate::types::{Direction, LiquidationUpdate};

/// Distance (as a fraction of price) at which a cluster's pull falls to 1/e
const DISTANCE_DECAY_PCT: f64 = 0.004;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiquidationProximity {
    pub long_score: f64,
    pub short_score: f64,
    pub long_distance_pct: Option<f64>,
    pub short_distance_pct: Option<f64>,
    /// p90 of decayed short-liquidation buckets
    pub short_cluster_p90: f64,
    /// p90 of decayed long-liquidation buckets
    pub long_cluster_p90: f64,
}

/// Heaviest nearby clusters, used downstream as stop anchors
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SweptZones {
    /// Lower edge of the heaviest long-liquidation bucket at or below price
    pub low: Option<f64>,
    /// Upper edge of the heaviest short-liquidation bucket at or above price
    pub high: Option<f64>,
}

/// Linear-interpolated percentile; a single value is returned as-is
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    match values.len() {
        0 => return 0.0,
        1 => return values[0],
        _ => {}
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.total_cmp(b));

    let index = pct.clamp(0.0, 1.0) * (ordered.len() - 1) as f64;
    let low = index.floor() as usize;
    let high = index.ceil() as usize;
    if low == high {
        return ordered[low];
    }
    let weight = index - low as f64;
    ordered[low] * (1.0 - weight) + ordered[high] * weight
}

#[derive(Debug, Clone)]
pub struct LiquidationBook {
    events: VecDeque<LiquidationUpdate>,
    window_ms: i64,
    bin_size: f64,
    decay_minutes: f64,
}

impl LiquidationBook {
    pub fn new(window_minutes: f64, bin_size: f64, decay_minutes: f64) -> Self {
        Self {
            events: VecDeque::new(),
            window_ms: (window_minutes * 60_000.0) as i64,
            bin_size,
            decay_minutes,
        }
    }

    pub fn from_config(config: &Layer0Config) -> Self {
        Self::new(
            config.cluster_window_minutes,
            config.cluster_bin_size,
            config.cluster_decay_minutes,
        )
    }

    pub fn add(&mut self, update: LiquidationUpdate) {
        let ts_ms = update.ts_ms;
        self.events.push_back(update);
        self.prune(ts_ms);
    }

    pub fn prune(&mut self, now_ms: i64) {
        // Feeds from different venues interleave, so arrival order is not time order
        let cutoff = now_ms - self.window_ms;
        self.events.retain(|e| e.ts_ms >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn bucket_index(&self, price: f64) -> i64 {
        (price / self.bin_size).floor() as i64
    }

    fn bucket_price(&self, index: i64) -> f64 {
        index as f64 * self.bin_size
    }

    /// Decayed notional per bucket for one liquidated side
    fn decayed_bins(&self, side: Direction, now_ms: i64) -> BTreeMap<i64, f64> {
        let mut bins = BTreeMap::new();
        for event in self.events.iter().filter(|e| e.liquidated_side == side) {
            let age_minutes = ((now_ms - event.ts_ms) as f64 / 60_000.0).max(0.0);
            let decay = (-age_minutes / self.decay_minutes).exp();
            *bins.entry(self.bucket_index(event.price)).or_insert(0.0) += event.notional * decay;
        }
        bins
    }

    fn on_side(&self, index: i64, current_price: f64, above: bool) -> bool {
        let price = self.bucket_price(index);
        if above {
            price >= current_price
        } else {
            price <= current_price
        }
    }

    /// (best score, its distance, p90 of all same-side buckets)
    fn direction_score(&self, bins: &BTreeMap<i64, f64>, current_price: f64, above: bool) -> (f64, Option<f64>, f64) {
        if bins.is_empty() {
            return (0.0, None, 0.0);
        }
        let values: Vec<f64> = bins.values().copied().collect();
        let p90 = percentile(&values, 0.90);
        if p90 <= 0.0 {
            return (0.0, None, 0.0);
        }

        let mut best = 0.0;
        let mut best_distance = None;
        for (&index, &notional) in bins {
            if !self.on_side(index, current_price, above) {
                continue;
            }
            let distance_pct = (self.bucket_price(index) - current_price).abs() / current_price;
            let base = (notional / p90).min(1.0);
            let score = base * (-(distance_pct / DISTANCE_DECAY_PCT)).exp();
            if score > best {
                best = score;
                best_distance = Some(distance_pct);
            }
        }
        (best, best_distance, p90)
    }

    pub fn proximity_scores(&mut self, current_price: f64, now_ms: i64) -> LiquidationProximity {
        self.prune(now_ms);
        let short_bins = self.decayed_bins(Direction::Short, now_ms);
        let long_bins = self.decayed_bins(Direction::Long, now_ms);

        let (long_score, long_distance_pct, short_cluster_p90) =
            self.direction_score(&short_bins, current_price, true);
        let (short_score, short_distance_pct, long_cluster_p90) =
            self.direction_score(&long_bins, current_price, false);

        LiquidationProximity {
            long_score,
            short_score,
            long_distance_pct,
            short_distance_pct,
            short_cluster_p90,
            long_cluster_p90,
        }
    }

    pub fn swept_zones(&self, current_price: f64, now_ms: i64) -> SweptZones {
        let heaviest = |bins: BTreeMap<i64, f64>, above: bool| {
            bins.into_iter()
                .filter(|(index, notional)| *notional > 0.0 && self.on_side(*index, current_price, above))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(index, _)| index)
        };

        let low = heaviest(self.decayed_bins(Direction::Long, now_ms), false).map(|idx| self.bucket_price(idx));
        let high = heaviest(self.decayed_bins(Direction::Short, now_ms), true)
            .map(|idx| self.bucket_price(idx) + self.bin_size);
        SweptZones { low, high }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn liquidation(price: f64, notional: f64, side: Direction, ts_ms: i64) -> LiquidationUpdate {
        LiquidationUpdate {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            price,
            quantity: notional / price,
            notional,
            liquidated_side: side,
            ts_ms,
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[], 0.9), 0.0);
        assert_eq!(percentile(&[42.0], 0.9), 42.0);
        let p = percentile(&[10.0, 0.0, 20.0], 0.9);
        assert!((p - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_events_score_both_sides() {
        let mut book = LiquidationBook::new(90.0, 100.0, 45.0);
        let now = 10_000_000;
        book.add(liquidation(10_120.0, 101_200.0, Direction::Short, now));
        book.add(liquidation(9_880.0, 79_040.0, Direction::Long, now));
        // Outside the 90 minute window
        book.add(liquidation(10_500.0, 210_000.0, Direction::Short, now - 6_000_000));

        let prox = book.proximity_scores(10_000.0, now);
        assert!(prox.long_score > 0.0 && prox.long_score <= 1.0);
        assert!(prox.short_score > 0.0 && prox.short_score <= 1.0);
        assert!(prox.long_distance_pct.is_some());
        assert!(prox.short_distance_pct.is_some());
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn test_no_same_side_bucket_is_none() {
        let mut book = LiquidationBook::new(90.0, 100.0, 45.0);
        let now = 10_000_000;
        // Short liquidations below price cannot pull a long setup
        book.add(liquidation(9_500.0, 50_000.0, Direction::Short, now));

        let prox = book.proximity_scores(10_000.0, now);
        assert_eq!(prox.long_score, 0.0);
        assert_eq!(prox.long_distance_pct, None);
        assert_eq!(prox.short_score, 0.0);
        assert_eq!(prox.short_distance_pct, None);
    }

    #[test]
    fn test_reported_distance_belongs_to_best_bucket() {
        let mut book = LiquidationBook::new(90.0, 100.0, 45.0);
        let now = 10_000_000;
        // Equal weight; the nearer bucket wins on distance decay
        book.add(liquidation(10_050.0, 100_000.0, Direction::Short, now));
        book.add(liquidation(10_250.0, 100_000.0, Direction::Short, now));

        let prox = book.proximity_scores(10_000.0, now);
        // Bucket 10_000 sits exactly at price
        assert_eq!(prox.long_distance_pct, Some(0.0));
        assert!((prox.long_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_swept_zones() {
        let mut book = LiquidationBook::new(90.0, 100.0, 45.0);
        let now = 10_000_000;
        book.add(liquidation(62_690.0, 400_000.0, Direction::Long, now));
        book.add(liquidation(62_850.0, 100_000.0, Direction::Long, now));
        book.add(liquidation(63_150.0, 300_000.0, Direction::Short, now));

        let zones = book.swept_zones(62_959.0, now);
        assert_eq!(zones.low, Some(62_600.0));
        assert_eq!(zones.high, Some(63_200.0));

        let empty = LiquidationBook::new(90.0, 100.0, 45.0);
        assert_eq!(empty.swept_zones(62_959.0, now), SweptZones::default());
    }
}
