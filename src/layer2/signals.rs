//! Ignition confirmations

use crate::config::Layer2ThresholdConfig;
use crate::types::{AbsorptionEvent, Candle, Direction, IgnitionBreakdown, StructureSignal};

/// Number of boolean confirmations an ignition can collect
pub const CONFIRMATION_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Momentum {
    pub confirmed: bool,
    /// `None` when there are not enough candles for the lookback
    pub return_pct: Option<f64>,
}

/// Close-to-close return over `lookback_bars`, signed by direction
pub fn compute_momentum(candles: &[Candle], direction: Direction, lookback_bars: usize, min_return_pct: f64) -> Momentum {
    if candles.len() <= lookback_bars {
        return Momentum::default();
    }
    let latest = candles[candles.len() - 1].close;
    let base = candles[candles.len() - 1 - lookback_bars].close;
    if base <= 0.0 {
        return Momentum::default();
    }
    let ret = latest / base - 1.0;
    let confirmed = match direction {
        Direction::Long => ret >= min_return_pct,
        Direction::Short => ret <= -min_return_pct,
    };
    Momentum {
        confirmed,
        return_pct: Some(ret),
    }
}

pub fn build_ignition_breakdown(
    absorption: &AbsorptionEvent,
    candles: &[Candle],
    structure: &StructureSignal,
    thresholds: &Layer2ThresholdConfig,
) -> (IgnitionBreakdown, Momentum) {
    let momentum = compute_momentum(
        candles,
        absorption.direction,
        thresholds.momentum_lookback_bars,
        thresholds.momentum_min_return_pct,
    );
    let absorption_strength = absorption.score >= thresholds.absorption_score_min;
    let trap_strength = absorption.raw.source_trap_score >= thresholds.trap_score_min;

    let confirmations = [
        structure.choch,
        structure.order_block,
        absorption_strength,
        trap_strength,
        momentum.confirmed,
    ]
    .iter()
    .filter(|hit| **hit)
    .count();

    let breakdown = IgnitionBreakdown {
        choch: structure.choch,
        order_block: structure.order_block,
        absorption_strength,
        trap_strength,
        momentum: momentum.confirmed,
        confirmations,
    };
    (breakdown, momentum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AbsorptionBreakdown, AbsorptionMeta};

    fn absorption(direction: Direction, score: f64, trap_score: f64) -> AbsorptionEvent {
        AbsorptionEvent {
            event_id: "abs-1".to_string(),
            ts_ms: 1_000_000,
            symbol: "BTCUSDT".to_string(),
            direction,
            score,
            passed: true,
            source_trap_event_id: "trap-1".to_string(),
            components: AbsorptionBreakdown {
                whale_net_flow_long: 1.0,
                twap_uniformity_long: 0.8,
                cvd_long: 1.0,
                ..Default::default()
            },
            raw: AbsorptionMeta {
                source_trap_score: trap_score,
                ..Default::default()
            },
            degraded: false,
            degrade_reason: None,
        }
    }

    fn candles_uptrend() -> Vec<Candle> {
        let base = 1_000_000;
        (0..8)
            .map(|i| {
                let price = 10_000.0 + i as f64 * 20.0;
                Candle {
                    open_time_ms: base + i * 60_000,
                    open: price,
                    high: price + 30.0,
                    low: price - 20.0,
                    close: price + 10.0,
                    volume: 100.0,
                    close_time_ms: base + (i + 1) * 60_000 - 1,
                }
            })
            .collect()
    }

    fn thresholds() -> Layer2ThresholdConfig {
        Layer2ThresholdConfig {
            min_confirmations: 3,
            absorption_score_min: 0.6,
            trap_score_min: 0.7,
            momentum_lookback_bars: 5,
            momentum_min_return_pct: 0.001,
        }
    }

    #[test]
    fn test_breakdown_hits_all_confirmations() {
        let structure = StructureSignal {
            choch: true,
            order_block: true,
            ..Default::default()
        };
        let (breakdown, momentum) = build_ignition_breakdown(
            &absorption(Direction::Long, 0.8, 0.9),
            &candles_uptrend(),
            &structure,
            &thresholds(),
        );
        assert_eq!(breakdown.confirmations, CONFIRMATION_COUNT);
        assert!(breakdown.momentum);
        assert!(momentum.return_pct.unwrap() > 0.0);
    }

    #[test]
    fn test_short_momentum_uses_falling_closes() {
        let mut candles = candles_uptrend();
        candles.reverse();
        let (breakdown, _) = build_ignition_breakdown(
            &absorption(Direction::Short, 0.8, 0.9),
            &candles,
            &StructureSignal::default(),
            &thresholds(),
        );
        assert!(breakdown.momentum);
        assert_eq!(breakdown.confirmations, 3);
    }

    #[test]
    fn test_momentum_needs_more_bars_than_lookback() {
        let candles = candles_uptrend();
        let momentum = compute_momentum(&candles[..5], Direction::Long, 5, 0.001);
        assert_eq!(momentum, Momentum::default());
    }

    #[test]
    fn test_weak_upstream_scores_do_not_confirm() {
        let (breakdown, _) = build_ignition_breakdown(
            &absorption(Direction::Long, 0.3, 0.1),
            &candles_uptrend(),
            &StructureSignal::default(),
            &thresholds(),
        );
        assert!(!breakdown.absorption_strength);
        assert!(!breakdown.trap_strength);
        assert_eq!(breakdown.confirmations, 1);
    }
}
