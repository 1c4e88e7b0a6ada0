//! Execution plan derivation
//!
//! Stops anchor on the swept liquidity zone and first targets on the
//! nearest order block; both fall back to fixed risk multiples.

use crate::config::Layer3RiskConfig;
use crate::types::{Direction, ExecutionPlan, PrePumpEvent};

/// Risk is never smaller than this fraction of entry
const MIN_RISK_FRACTION: f64 = 0.0005;
/// TP1 must sit at least this many R beyond entry
const MIN_TP1_R: f64 = 0.8;

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

/// Half-to-even rounding at `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

/// Entry reference: explicit entry, ignition price, absorption price, trap price
pub fn derive_entry_price(event: &PrePumpEvent) -> Option<f64> {
    let raw = &event.raw;
    positive(raw.entry)
        .or(positive(raw.current_price))
        .or(positive(raw.source_absorption_raw.current_price))
        .or(positive(Some(raw.source_trap_raw().current_price)))
}

/// Anchor levels resolved from the ignition metadata, then upstream
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlanAnchors {
    pub zone_low: Option<f64>,
    pub zone_high: Option<f64>,
    pub ob_above: Option<f64>,
    pub ob_below: Option<f64>,
}

impl PlanAnchors {
    pub fn from_event(event: &PrePumpEvent) -> Self {
        let raw = &event.raw;
        let trap = raw.source_trap_raw();
        Self {
            zone_low: raw.swept_liquidation_zone_low.or(trap.swept_liquidation_zone_low),
            zone_high: raw.swept_liquidation_zone_high.or(trap.swept_liquidation_zone_high),
            ob_above: raw.nearest_ob_above.or(raw.smc_meta.nearest_ob_above),
            ob_below: raw.nearest_ob_below.or(raw.smc_meta.nearest_ob_below),
        }
    }
}

pub fn build_execution_plan(
    event: &PrePumpEvent,
    entry: f64,
    quantity: f64,
    risk_config: &Layer3RiskConfig,
) -> ExecutionPlan {
    plan_from_anchors(event.direction, &PlanAnchors::from_event(event), entry, quantity, risk_config)
}

pub fn plan_from_anchors(
    direction: Direction,
    anchors: &PlanAnchors,
    entry: f64,
    quantity: f64,
    risk_config: &Layer3RiskConfig,
) -> ExecutionPlan {
    let tp1_r = risk_config.tp1_r_multiple;
    let tp2_r = risk_config.tp2_r_multiple;
    let min_risk = entry * MIN_RISK_FRACTION;

    let (sl, tp1, tp2, sl_pct, tp1_pct, tp2_pct) = match direction {
        Direction::Long => {
            let sl = anchors
                .zone_low
                .filter(|z| *z < entry)
                .unwrap_or(entry * (1.0 - risk_config.default_sl_buffer_pct));
            let risk = (entry - sl).max(min_risk);
            let tp2 = entry + tp2_r * risk;
            let mut tp1 = anchors
                .ob_above
                .filter(|ob| *ob > entry)
                .unwrap_or(entry + tp1_r * risk)
                .max(entry + MIN_TP1_R * risk);
            if tp1 >= tp2 {
                tp1 = entry + tp1_r * risk;
            }
            (sl, tp1, tp2, sl / entry - 1.0, tp1 / entry - 1.0, tp2 / entry - 1.0)
        }
        Direction::Short => {
            let sl = anchors
                .zone_high
                .filter(|z| *z > entry)
                .unwrap_or(entry * (1.0 + risk_config.default_sl_buffer_pct));
            let risk = (sl - entry).max(min_risk);
            let tp2 = entry - tp2_r * risk;
            let mut tp1 = anchors
                .ob_below
                .filter(|ob| *ob < entry)
                .unwrap_or(entry - tp1_r * risk)
                .min(entry - MIN_TP1_R * risk);
            if tp1 <= tp2 {
                tp1 = entry - tp1_r * risk;
            }
            (sl, tp1, tp2, entry / sl - 1.0, entry / tp1 - 1.0, entry / tp2 - 1.0)
        }
    };

    let rr = if entry != sl {
        ((tp2 - entry) / (entry - sl)).abs()
    } else {
        tp2_r
    };

    ExecutionPlan {
        entry: round_to(entry, 2),
        sl: round_to(sl, 2),
        tp1: round_to(tp1, 2),
        tp2: round_to(tp2, 2),
        rr: round_to(rr, 2),
        sl_pct,
        tp1_pct,
        tp2_pct,
        quantity,
        risk_amount: (entry - sl).abs() * quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AbsorptionMeta, IgnitionBreakdown, IgnitionMeta, TrapMeta};

    fn event(direction: Direction) -> PrePumpEvent {
        PrePumpEvent {
            event_id: "pre-1".to_string(),
            ts_ms: 1_000_000,
            symbol: "BTCUSDT".to_string(),
            direction,
            score: 0.8,
            passed: true,
            source_absorption_event_id: "abs-1".to_string(),
            source_trap_event_id: "trap-1".to_string(),
            components: IgnitionBreakdown {
                choch: true,
                order_block: true,
                absorption_strength: true,
                trap_strength: true,
                momentum: false,
                confirmations: 4,
            },
            raw: IgnitionMeta {
                source_absorption_raw: AbsorptionMeta {
                    current_price: Some(62_959.0),
                    source_trap_raw: TrapMeta {
                        swept_liquidation_zone_low: Some(62_680.0),
                        swept_liquidation_zone_high: Some(63_200.0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                nearest_ob_above: Some(64_200.0),
                nearest_ob_below: Some(61_900.0),
                ..Default::default()
            },
            degraded: false,
            degrade_reason: None,
        }
    }

    fn risk() -> Layer3RiskConfig {
        Layer3RiskConfig {
            default_sl_buffer_pct: 0.0044,
            tp1_r_multiple: 1.5,
            tp2_r_multiple: 2.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_to_breaks_ties_to_even() {
        assert_eq!(round_to(0.125, 2), 0.12);
        assert_eq!(round_to(0.375, 2), 0.38);
        assert_eq!(round_to(2.5, 0), 2.0);
        assert_eq!(round_to(10_012.125, 2), 10_012.12);
        assert_eq!(round_to(-0.125, 2), -0.12);
    }

    #[test]
    fn test_entry_falls_back_through_chain() {
        let mut ev = event(Direction::Long);
        assert_eq!(derive_entry_price(&ev), Some(62_959.0));

        ev.raw.current_price = Some(63_000.0);
        assert_eq!(derive_entry_price(&ev), Some(63_000.0));

        ev.raw.entry = Some(0.0);
        assert_eq!(derive_entry_price(&ev), Some(63_000.0));

        let mut bare = event(Direction::Long);
        bare.raw.source_absorption_raw.current_price = None;
        assert_eq!(derive_entry_price(&bare), None);
        bare.raw.source_absorption_raw.source_trap_raw.current_price = 62_000.0;
        assert_eq!(derive_entry_price(&bare), Some(62_000.0));
    }

    #[test]
    fn test_long_plan_uses_zone_low_and_tp2_multiple() {
        let plan = build_execution_plan(&event(Direction::Long), 62_959.0, 0.01, &risk());
        assert_eq!(plan.sl, 62_680.0);
        assert_eq!(plan.tp2, round_to(62_959.0 + (62_959.0 - 62_680.0) * 2.5, 2));
        assert!(plan.tp1 > plan.entry);
        assert!(plan.tp1 < plan.tp2);
        // The order block sits beyond TP2, so TP1 reverts to the fixed multiple
        assert_eq!(plan.tp1, 63_377.5);
        assert_eq!(plan.rr, 2.5);
    }

    #[test]
    fn test_short_plan_uses_zone_high() {
        let plan = build_execution_plan(&event(Direction::Short), 62_959.0, 0.01, &Layer3RiskConfig::default());
        assert_eq!(plan.sl, 63_200.0);
        assert!(plan.tp2 < plan.entry);
        assert!(plan.tp1 < plan.entry);
        assert!(plan.tp1 > plan.tp2);
    }

    #[test]
    fn test_zone_on_wrong_side_uses_buffer() {
        let anchors = PlanAnchors {
            zone_low: Some(63_500.0),
            ..Default::default()
        };
        let plan = plan_from_anchors(Direction::Long, &anchors, 10_000.0, 1.0, &risk());
        assert_eq!(plan.sl, 9_956.0);
        assert_eq!(plan.tp2, 10_110.0);
        assert_eq!(plan.tp1, 10_066.0);
    }

    #[test]
    fn test_risk_floor_applies_to_tight_stops() {
        let anchors = PlanAnchors {
            zone_low: Some(9_999.9),
            ..Default::default()
        };
        let plan = plan_from_anchors(Direction::Long, &anchors, 10_000.0, 1.0, &risk());
        // Risk floors at 5 (0.05% of entry)
        assert_eq!(plan.tp2, 10_012.5);
    }

    #[test]
    fn test_order_block_inside_range_sets_tp1() {
        let anchors = PlanAnchors {
            zone_low: Some(9_900.0),
            ob_above: Some(10_150.0),
            ..Default::default()
        };
        let plan = plan_from_anchors(Direction::Long, &anchors, 10_000.0, 1.0, &risk());
        assert_eq!(plan.tp1, 10_150.0);
        assert_eq!(plan.tp2, 10_250.0);
        assert_eq!(plan.risk_amount, 100.0);
    }
}
