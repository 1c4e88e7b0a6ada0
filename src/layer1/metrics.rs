//! Absorption metrics over a rolling trade window

use crate::config::{Layer1ThresholdConfig, Layer1Weights};
use crate::types::{clamp01, AbsorptionBreakdown, Direction, OrderBookTick, TradeTick};

/// Floor applied to a direction's CVD score on hidden divergence
const HIDDEN_DIVERGENCE_FLOOR: f64 = 0.6;
/// Added to the blended score on hidden divergence
const HIDDEN_DIVERGENCE_BONUS: f64 = 0.1;

/// Buyer-maker trades were seller-aggressive and count negative
pub fn signed_notional(trade: &TradeTick) -> f64 {
    if trade.is_buyer_maker {
        -trade.notional()
    } else {
        trade.notional()
    }
}

fn scaled(value: f64, scale: f64) -> f64 {
    if scale > 0.0 {
        clamp01(value.max(0.0) / scale)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WhaleFlow {
    pub long: f64,
    pub short: f64,
    pub net_flow_usd: f64,
}

pub fn compute_whale_net_flow_scores(trades: &[TradeTick], min_notional: f64, scale_usd: f64) -> WhaleFlow {
    let net_flow_usd: f64 = trades
        .iter()
        .filter(|t| t.notional() >= min_notional)
        .map(signed_notional)
        .sum();
    WhaleFlow {
        long: scaled(net_flow_usd, scale_usd),
        short: scaled(-net_flow_usd, scale_usd),
        net_flow_usd,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TwapUniformity {
    pub long: f64,
    pub short: f64,
    /// Coefficient of variation of whale inter-arrival times
    pub interval_cv: Option<f64>,
    pub whale_count: usize,
}

pub fn compute_twap_uniformity_scores(trades: &[TradeTick], min_notional: f64, cv_limit: f64) -> TwapUniformity {
    let mut whales: Vec<&TradeTick> = trades.iter().filter(|t| t.notional() >= min_notional).collect();
    let whale_count = whales.len();
    let empty = TwapUniformity {
        whale_count,
        ..Default::default()
    };
    if whale_count < 3 {
        return empty;
    }

    whales.sort_by_key(|t| t.ts_ms);
    let intervals: Vec<f64> = whales
        .windows(2)
        .map(|pair| (pair[1].ts_ms - pair[0].ts_ms) as f64 / 1000.0)
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return empty;
    }
    let variance = intervals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    let cv = variance.sqrt() / mean;

    let uniformity = if cv_limit > 0.0 { clamp01(1.0 - cv / cv_limit) } else { 0.0 };
    let buy_aggressive = whales.iter().filter(|t| !t.is_buyer_maker).count();
    let buy_share = buy_aggressive as f64 / whale_count as f64;

    TwapUniformity {
        long: uniformity * buy_share,
        short: uniformity * (1.0 - buy_share),
        interval_cv: Some(cv),
        whale_count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CvdScores {
    pub long: f64,
    pub short: f64,
    pub delta_usd: f64,
    pub price_delta_pct: f64,
    /// Price up while CVD is down
    pub hidden_long: bool,
    /// Price down while CVD is up
    pub hidden_short: bool,
}

pub fn compute_cvd_scores(trades: &[TradeTick], cvd_scale_usd: f64) -> CvdScores {
    if trades.len() < 2 {
        return CvdScores::default();
    }
    let mut ordered: Vec<&TradeTick> = trades.iter().collect();
    ordered.sort_by_key(|t| t.ts_ms);

    let delta_usd: f64 = ordered.iter().map(|t| signed_notional(t)).sum();
    let start = ordered[0].price;
    let end = ordered[ordered.len() - 1].price;
    let price_delta_pct = if start > 0.0 { end / start - 1.0 } else { 0.0 };

    let hidden_long = price_delta_pct > 0.0 && delta_usd < 0.0;
    let hidden_short = price_delta_pct < 0.0 && delta_usd > 0.0;

    let mut long = scaled(delta_usd, cvd_scale_usd);
    let mut short = scaled(-delta_usd, cvd_scale_usd);
    if hidden_long {
        long = long.max(HIDDEN_DIVERGENCE_FLOOR);
    }
    if hidden_short {
        short = short.max(HIDDEN_DIVERGENCE_FLOOR);
    }

    CvdScores {
        long,
        short,
        delta_usd,
        price_delta_pct,
        hidden_long,
        hidden_short,
    }
}

pub fn compute_stablecoin_inflow_score(inflow_usd: f64, scale_usd: f64) -> f64 {
    scaled(inflow_usd, scale_usd)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrderbookImbalance {
    pub long: f64,
    pub short: f64,
    pub average: Option<f64>,
    pub tick_count: usize,
}

/// Mean top-of-book quantity imbalance; ticks with no size are ignored
pub fn compute_orderbook_imbalance(books: &[OrderBookTick]) -> OrderbookImbalance {
    let imbalances: Vec<f64> = books
        .iter()
        .filter(|b| b.bid_qty + b.ask_qty > 0.0)
        .map(|b| (b.bid_qty - b.ask_qty) / (b.bid_qty + b.ask_qty))
        .collect();
    if imbalances.is_empty() {
        return OrderbookImbalance {
            tick_count: books.len(),
            ..Default::default()
        };
    }
    let average = imbalances.iter().sum::<f64>() / imbalances.len() as f64;
    OrderbookImbalance {
        long: clamp01(average.max(0.0)),
        short: clamp01((-average).max(0.0)),
        average: Some(average),
        tick_count: books.len(),
    }
}

pub fn compute_absorption_score(breakdown: &AbsorptionBreakdown, direction: Direction, weights: &Layer1Weights) -> f64 {
    let [whale, twap, cvd, stablecoin] = breakdown.for_direction(direction);
    let mut score = weights.whale_net_flow * whale
        + weights.twap_uniformity * twap
        + weights.cvd * cvd
        + weights.stablecoin_inflow * stablecoin;
    if breakdown.hidden_divergence(direction) {
        score += HIDDEN_DIVERGENCE_BONUS;
    }
    clamp01(score)
}

/// Hidden divergence counts as one extra component hit
pub fn passes_absorption_gate(
    breakdown: &AbsorptionBreakdown,
    direction: Direction,
    score: f64,
    thresholds: &Layer1ThresholdConfig,
) -> bool {
    if score < thresholds.score_threshold {
        return false;
    }
    let mut hits = breakdown
        .for_direction(direction)
        .iter()
        .filter(|c| **c >= thresholds.component_threshold)
        .count();
    if breakdown.hidden_divergence(direction) {
        hits += 1;
    }
    hits >= thresholds.min_component_hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts_ms: i64, price: f64, quantity: f64, is_buyer_maker: bool) -> TradeTick {
        TradeTick {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            price,
            quantity,
            is_buyer_maker,
            ts_ms,
        }
    }

    fn book(bid_qty: f64, ask_qty: f64) -> OrderBookTick {
        OrderBookTick {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            bid_price: 10_000.0,
            bid_qty,
            ask_price: 10_001.0,
            ask_qty,
            ts_ms: 1,
        }
    }

    #[test]
    fn test_whale_net_flow_is_directional() {
        let trades = [
            trade(1, 10_000.0, 20.0, false),
            trade(2, 10_000.0, 15.0, false),
            trade(3, 10_000.0, 5.0, true),
        ];
        let flow = compute_whale_net_flow_scores(&trades, 100_000.0, 200_000.0);
        // The 50k sell is below the whale floor
        assert_eq!(flow.net_flow_usd, 350_000.0);
        assert_eq!(flow.long, 1.0);
        assert_eq!(flow.short, 0.0);
    }

    #[test]
    fn test_twap_prefers_uniform_buy_program() {
        let trades: Vec<TradeTick> = (1..=4)
            .map(|i| trade(i * 1_000, 10_000.0 + i as f64 * 10.0, 20.0, false))
            .collect();
        let twap = compute_twap_uniformity_scores(&trades, 100_000.0, 0.35);
        assert_eq!(twap.whale_count, 4);
        assert_eq!(twap.interval_cv, Some(0.0));
        assert!(twap.long > 0.9);
        assert_eq!(twap.short, 0.0);

        let sparse = compute_twap_uniformity_scores(&trades[..2], 100_000.0, 0.35);
        assert_eq!(sparse.interval_cv, None);
        assert_eq!(sparse.whale_count, 2);
    }

    #[test]
    fn test_cvd_hidden_divergence_sets_long_flag() {
        let trades = [
            trade(1_000, 10_000.0, 10.0, true),
            trade(2_000, 10_050.0, 10.0, true),
            trade(3_000, 10_100.0, 10.0, true),
        ];
        let cvd = compute_cvd_scores(&trades, 2_000_000.0);
        assert!(cvd.delta_usd < 0.0);
        assert!(cvd.price_delta_pct > 0.0);
        assert!(cvd.hidden_long);
        assert!(!cvd.hidden_short);
        assert!(cvd.long >= 0.6);
        assert!(cvd.short > 0.0);
    }

    #[test]
    fn test_absorption_gate() {
        let thresholds = Layer1ThresholdConfig::default();
        let weights = Layer1Weights::default();
        let breakdown = AbsorptionBreakdown {
            whale_net_flow_long: 1.0,
            twap_uniformity_long: 1.0,
            cvd_long: 1.0,
            ..Default::default()
        };
        let score = compute_absorption_score(&breakdown, Direction::Long, &weights);
        assert!(score > thresholds.score_threshold);
        assert!(passes_absorption_gate(&breakdown, Direction::Long, score, &thresholds));

        let short_score = compute_absorption_score(&breakdown, Direction::Short, &weights);
        assert_eq!(short_score, 0.0);
        assert!(!passes_absorption_gate(&breakdown, Direction::Short, short_score, &thresholds));
    }

    #[test]
    fn test_hidden_divergence_bonus_and_extra_hit() {
        let thresholds = Layer1ThresholdConfig {
            score_threshold: 0.25,
            ..Default::default()
        };
        let breakdown = AbsorptionBreakdown {
            cvd_long: 0.6,
            hidden_divergence_long: true,
            ..Default::default()
        };
        let score = compute_absorption_score(&breakdown, Direction::Long, &Layer1Weights::default());
        assert!((score - (0.30 * 0.6 + 0.1)).abs() < 1e-9);
        // One strong component plus the divergence hit reaches two
        assert!(passes_absorption_gate(&breakdown, Direction::Long, score, &thresholds));

        // Same breakdown, stricter score gate
        let strict = Layer1ThresholdConfig {
            score_threshold: 0.3,
            ..Default::default()
        };
        assert!(!passes_absorption_gate(&breakdown, Direction::Long, score, &strict));
    }

    #[test]
    fn test_single_component_without_divergence_misses_hits() {
        let thresholds = Layer1ThresholdConfig {
            score_threshold: 0.1,
            ..Default::default()
        };
        let breakdown = AbsorptionBreakdown {
            cvd_long: 0.6,
            ..Default::default()
        };
        let score = compute_absorption_score(&breakdown, Direction::Long, &Layer1Weights::default());
        assert!((score - 0.18).abs() < 1e-9);
        assert!(!passes_absorption_gate(&breakdown, Direction::Long, score, &thresholds));
    }

    #[test]
    fn test_orderbook_imbalance_is_directional() {
        let imbalance = compute_orderbook_imbalance(&[book(120.0, 80.0), book(130.0, 70.0)]);
        assert_eq!(imbalance.tick_count, 2);
        assert!((imbalance.average.unwrap() - 0.25).abs() < 1e-9);
        assert!(imbalance.long > imbalance.short);

        let empty = compute_orderbook_imbalance(&[book(0.0, 0.0)]);
        assert_eq!(empty.average, None);
        assert_eq!(empty.tick_count, 1);
    }
}
