//! Confidence-scaled position sizing

use crate::config::SizingConfig;
use crate::types::{clamp, clamp01, PrePumpEvent};

use super::planner::round_to;

/// Blend of upstream scores used for sizing
pub fn chain_confidence(event: &PrePumpEvent) -> f64 {
    let raw = &event.raw;
    let regime = raw.source_trap_raw().regime_score(event.direction);
    clamp01(0.3 * raw.source_trap_score + 0.3 * raw.absorption_score + 0.2 * event.score + 0.2 * regime)
}

/// Quantity multiplier; 1.0 when sizing is disabled
pub fn size_multiplier(event: &PrePumpEvent, config: &SizingConfig) -> f64 {
    if !config.enabled {
        return 1.0;
    }
    let (lo, hi) = (config.min_multiplier, config.max_multiplier);
    let mut multiplier = clamp(lo + (hi - lo) * chain_confidence(event), lo, hi);
    if event.degraded || event.raw.chain_degraded() {
        multiplier *= config.degraded_factor;
    }
    multiplier
}

pub fn sized_quantity(base_quantity: f64, multiplier: f64) -> f64 {
    round_to(base_quantity * multiplier, 6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, IgnitionBreakdown, IgnitionMeta};

    fn event(scores: (f64, f64, f64)) -> PrePumpEvent {
        PrePumpEvent {
            event_id: "pre-1".to_string(),
            ts_ms: 0,
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            score: scores.2,
            passed: true,
            source_absorption_event_id: "abs-1".to_string(),
            source_trap_event_id: "trap-1".to_string(),
            components: IgnitionBreakdown::default(),
            raw: IgnitionMeta {
                source_trap_score: scores.0,
                absorption_score: scores.1,
                ..Default::default()
            },
            degraded: false,
            degrade_reason: None,
        }
    }

    fn enabled() -> SizingConfig {
        SizingConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_sizing_is_neutral() {
        assert_eq!(size_multiplier(&event((1.0, 1.0, 1.0)), &SizingConfig::default()), 1.0);
    }

    #[test]
    fn test_confidence_interpolates_between_bounds() {
        let config = enabled();
        // No regime score: 0.3 + 0.3 + 0.2 = 0.8
        let full = event((1.0, 1.0, 1.0));
        assert!((chain_confidence(&full) - 0.8).abs() < 1e-9);
        assert!((size_multiplier(&full, &config) - 1.3).abs() < 1e-9);

        let empty = event((0.0, 0.0, 0.0));
        assert_eq!(size_multiplier(&empty, &config), config.min_multiplier);
    }

    #[test]
    fn test_degraded_chain_is_cut() {
        let config = enabled();
        let mut ev = event((1.0, 1.0, 1.0));
        ev.raw.source_absorption_raw.source_trap_degraded = true;
        assert!((size_multiplier(&ev, &config) - 1.3 * 0.7).abs() < 1e-9);
        assert_eq!(sized_quantity(0.001, size_multiplier(&ev, &config)), 0.00091);
    }
}
