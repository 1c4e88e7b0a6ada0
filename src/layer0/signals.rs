//! Layer0 signal math
//!
//! Pure functions only; the detector feeds them snapshots of its rolling
//! state each cycle.

use std::collections::VecDeque;

use crate::config::{AdaptiveGateConfig, RegimeFilterConfig, SignalWeights, ThresholdConfig};
use crate::types::{clamp, clamp01, Direction, FundingOiMeta, OIObservation, RegimeMeta, SignalBreakdown};

/// Window for OI change and acceleration
pub const OI_WINDOW_MS: i64 = 300_000;

/// sqrt of the sum of squared log returns
pub fn compute_realized_volatility(prices: &[f64]) -> f64 {
    let sum_sq: f64 = prices
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| (pair[1] / pair[0]).ln().powi(2))
        .sum();
    sum_sq.sqrt()
}

/// Simple return over the last `lookback` points
pub fn compute_return(prices: &[f64], lookback: usize) -> f64 {
    if prices.len() <= lookback {
        return 0.0;
    }
    let base = prices[prices.len() - lookback - 1];
    if base <= 0.0 {
        return 0.0;
    }
    prices[prices.len() - 1] / base - 1.0
}

/// EMA seeded with the first price
pub fn compute_ema(prices: &[f64], span: usize) -> f64 {
    let Some((&first, rest)) = prices.split_first() else {
        return 0.0;
    };
    if span <= 1 {
        return prices[prices.len() - 1];
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    rest.iter().fold(first, |ema, &price| alpha * price + (1.0 - alpha) * ema)
}

fn latest_at_or_before(history: &VecDeque<OIObservation>, ts_ms: i64) -> Option<&OIObservation> {
    history.iter().take_while(|row| row.ts_ms <= ts_ms).last()
}

/// Percent OI change from the last sample at or before `now - window` to the latest
pub fn compute_oi_pct_change(history: &VecDeque<OIObservation>, now_ms: i64, window_ms: i64) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let latest = history.back()?;
    let reference = latest_at_or_before(history, now_ms - window_ms).or_else(|| history.front())?;
    if reference.open_interest <= 0.0 {
        return None;
    }
    Some((latest.open_interest / reference.open_interest - 1.0) * 100.0)
}

/// Change of the 5m OI change versus the 5m before it
pub fn compute_oi_acceleration(history: &VecDeque<OIObservation>, now_ms: i64) -> Option<f64> {
    let current = compute_oi_pct_change(history, now_ms, OI_WINDOW_MS)?;
    let prior = compute_oi_pct_change(history, now_ms - OI_WINDOW_MS, OI_WINDOW_MS)?;
    Some(current - prior)
}

/// (score, spread) of cross-exchange OI change dispersion
pub fn compute_oi_divergence_score(oi_changes_pct: &[f64], floor: f64, span: f64) -> (f64, f64) {
    if oi_changes_pct.len() < 2 {
        return (0.0, 0.0);
    }
    let max = oi_changes_pct.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = oi_changes_pct.iter().copied().fold(f64::INFINITY, f64::min);
    let spread = max - min;
    (clamp01((spread - floor) / span), spread)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Funding/OI fusion; returns (long, short, diagnostics)
pub fn compute_funding_oi_scores(
    funding_rates: &[f64],
    oi_changes_pct: &[f64],
    oi_accels_pct: &[f64],
    rv_1h: f64,
    ret_5m: f64,
    thresholds: &ThresholdConfig,
) -> (f64, f64, FundingOiMeta) {
    let avg_funding = mean(funding_rates);
    let avg_oi_change = mean(oi_changes_pct);
    let avg_oi_accel = mean(oi_accels_pct);

    let funding_long = clamp01(-avg_funding / thresholds.funding_scale);
    let funding_short = clamp01(avg_funding / thresholds.funding_scale);
    let oi_rise = clamp01(avg_oi_change / thresholds.oi_pct_scale);
    let oi_accel = clamp01(avg_oi_accel / thresholds.oi_accel_scale);

    let compression = clamp01(1.0 - ret_5m.abs() / thresholds.compression_return_cap);
    let low_vol = rv_1h < thresholds.rv_low_vol_threshold;

    let (long_score, short_score) = if low_vol {
        (
            (0.65 * funding_long + 0.35 * oi_rise) * compression,
            (0.65 * funding_short + 0.35 * oi_rise) * compression,
        )
    } else {
        let oi_drive = oi_rise.max(oi_accel);
        (
            (0.35 * funding_long + 0.65 * oi_drive) * compression,
            (0.35 * funding_short + 0.65 * oi_drive) * compression,
        )
    };

    let meta = FundingOiMeta {
        avg_funding,
        avg_oi_change_pct: avg_oi_change,
        avg_oi_accel_pct: avg_oi_accel,
        rv_1h,
        ret_5m,
        compression,
        regime: if low_vol { "LOW_VOL" } else { "HIGH_VOL" }.to_string(),
    };
    (clamp01(long_score), clamp01(short_score), meta)
}

/// Trend/volatility regime; returns (long, short, diagnostics)
pub fn compute_regime_scores(
    prices: &[f64],
    rv_1h: f64,
    ret_5m: f64,
    regime: &RegimeFilterConfig,
) -> (f64, f64, RegimeMeta) {
    let state_only = |state: &str, gate: f64| RegimeMeta {
        regime_state: state.to_string(),
        volatility_gate: gate,
        ..Default::default()
    };

    let Some(&last_price) = prices.last() else {
        return (0.0, 0.0, state_only("NO_PRICE", 0.0));
    };
    if prices.len() < regime.trend_ema_slow.max(8) {
        return (0.5, 0.5, state_only("INSUFFICIENT_HISTORY", 0.5));
    }
    if last_price <= 0.0 {
        return (0.0, 0.0, state_only("BAD_PRICE", 0.0));
    }

    let tail = |len: usize| &prices[prices.len().saturating_sub(len)..];
    let ema_fast = compute_ema(
        tail((regime.trend_ema_fast * 3).max(regime.trend_ema_slow + 5)),
        regime.trend_ema_fast,
    );
    let ema_slow = compute_ema(
        tail((regime.trend_ema_slow * 3).max(regime.trend_ema_slow + 5)),
        regime.trend_ema_slow,
    );
    let trend_gap_pct = (ema_fast - ema_slow) / last_price;

    let trend_long = clamp01(0.5 + (trend_gap_pct / regime.trend_gap_scale_pct.max(1e-9)) * 0.5);
    let trend_short = clamp01(1.0 - trend_long);

    let compression = clamp01(1.0 - ret_5m.abs() / regime.max_abs_ret_5m.max(1e-9));
    let (volatility_gate, regime_state) = if rv_1h >= regime.panic_vol_cutoff {
        (0.0, "PANIC_VOL")
    } else {
        (clamp01(1.0 - rv_1h / regime.panic_vol_cutoff.max(1e-9)), "NORMAL")
    };

    let calm = compression * volatility_gate;
    let meta = RegimeMeta {
        regime_state: regime_state.to_string(),
        ema_fast: Some(ema_fast),
        ema_slow: Some(ema_slow),
        trend_gap_pct,
        volatility_gate,
        compression_regime: Some(compression),
    };
    (
        clamp01(0.6 * trend_long + 0.4 * calm),
        clamp01(0.6 * trend_short + 0.4 * calm),
        meta,
    )
}

/// Nearest-rank quantile of recent best scores, bounded to
/// `[max(base, floor), ceiling]`; `base` until enough samples exist.
pub fn compute_adaptive_threshold(observed: &[f64], config: &AdaptiveGateConfig, base_threshold: f64) -> f64 {
    if !config.enabled || observed.len() < config.min_samples.max(1) {
        return base_threshold;
    }
    let mut ranked = observed.to_vec();
    ranked.sort_by(|a, b| a.total_cmp(b));

    let quantile = clamp01(config.quantile);
    let idx = ((ranked.len() - 1) as f64 * quantile).round_ties_even() as usize;
    let lower = base_threshold.max(config.floor);
    let upper = config.ceiling.max(lower);
    clamp(ranked[idx], lower, upper)
}

pub fn compute_directional_score(breakdown: &SignalBreakdown, direction: Direction, weights: &SignalWeights) -> f64 {
    let [liq, funding_oi, oi_div] = breakdown.for_direction(direction);
    weights.liquidation * liq + weights.funding_oi * funding_oi + weights.oi_divergence * oi_div
}

/// Score at or above the active threshold and at least 2 of 3 components strong
pub fn passes_gate(
    breakdown: &SignalBreakdown,
    direction: Direction,
    score: f64,
    thresholds: &ThresholdConfig,
    threshold_override: Option<f64>,
) -> bool {
    let active = threshold_override.unwrap_or(thresholds.score_threshold);
    if score < active {
        return false;
    }
    let strong = breakdown
        .for_direction(direction)
        .iter()
        .filter(|c| **c >= thresholds.component_threshold)
        .count();
    strong >= 2
}

/// Every venue that has reported OI must span the warmup window, and at
/// least one must have reported. One warm venue is not enough while another
/// reporting venue is still filling its history. Venues that never answered
/// do not block; they surface as `<NAME>_NO_SNAPSHOT` instead.
pub fn has_warmup_window<'a, I>(histories: I, now_ms: i64, warmup_ms: i64) -> bool
where
    I: IntoIterator<Item = &'a VecDeque<OIObservation>>,
{
    let mut seen = 0usize;
    for history in histories {
        let Some(first) = history.front() else {
            continue;
        };
        if now_ms - first.ts_ms < warmup_ms {
            return false;
        }
        seen += 1;
    }
    seen > 0
}
