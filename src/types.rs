//! Data model shared by every layer
//!
//! Market observations flow in from the exchange adapters; events flow
//! layer to layer. Each event carries typed metadata for its own stage plus
//! the metadata of the stage it was derived from, so the executor and the
//! notifier can walk the full causal chain without untyped maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh random event identifier
pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Clamp into `[lower, upper]` (unit interval by default via [`clamp01`])
pub fn clamp(value: f64, lower: f64, upper: f64) -> f64 {
    value.max(lower).min(upper)
}

pub fn clamp01(value: f64) -> f64 {
    clamp(value, 0.0, 1.0)
}

/// Deduplicate, sort and pipe-join degrade reasons
pub fn join_reasons(reasons: &[String]) -> Option<String> {
    if reasons.is_empty() {
        return None;
    }
    let mut unique: Vec<&str> = reasons.iter().map(String::as_str).collect();
    unique.sort_unstable();
    unique.dedup();
    Some(unique.join("|"))
}

/// Trade direction of a setup or position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market observations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub exchange: String,
    pub symbol: String,
    pub open_interest: Option<f64>,
    pub funding_rate: Option<f64>,
    pub mark_price: Option<f64>,
    pub ts_ms: i64,
    pub active: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OIObservation {
    pub ts_ms: i64,
    pub open_interest: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationUpdate {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub notional: f64,
    /// Side of the position that was force-closed
    pub liquidated_side: Direction,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// True when the seller was the aggressor
    pub is_buyer_maker: bool,
    pub ts_ms: i64,
}

impl TradeTick {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookTick {
    pub exchange: String,
    pub symbol: String,
    pub bid_price: f64,
    pub bid_qty: f64,
    pub ask_price: f64,
    pub ask_qty: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StablecoinFlowObservation {
    pub source: String,
    pub inflow_usd: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time_ms: i64,
}

// ---------------------------------------------------------------------------
// Layer0: trap setup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub liquidation_long: f64,
    pub liquidation_short: f64,
    pub funding_oi_long: f64,
    pub funding_oi_short: f64,
    pub oi_divergence: f64,
}

impl SignalBreakdown {
    /// (liquidation, funding/OI, OI divergence) for one direction
    pub fn for_direction(&self, direction: Direction) -> [f64; 3] {
        match direction {
            Direction::Long => [self.liquidation_long, self.funding_oi_long, self.oi_divergence],
            Direction::Short => [self.liquidation_short, self.funding_oi_short, self.oi_divergence],
        }
    }
}

/// Funding/OI fusion diagnostics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FundingOiMeta {
    pub avg_funding: f64,
    pub avg_oi_change_pct: f64,
    pub avg_oi_accel_pct: f64,
    pub rv_1h: f64,
    pub ret_5m: f64,
    pub compression: f64,
    /// `LOW_VOL` or `HIGH_VOL`
    pub regime: String,
}

/// Trend/volatility filter diagnostics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegimeMeta {
    /// `NORMAL`, `PANIC_VOL`, `INSUFFICIENT_HISTORY`, `NO_PRICE` or `BAD_PRICE`
    pub regime_state: String,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub trend_gap_pct: f64,
    pub volatility_gate: f64,
    pub compression_regime: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrapMeta {
    pub active_exchanges: Vec<String>,
    pub oi_spread_pct: f64,
    pub oi_changes_pct: BTreeMap<String, f64>,
    pub oi_accel_pct: BTreeMap<String, f64>,
    pub current_price: f64,
    pub long_score: f64,
    pub short_score: f64,
    pub secondary_score: f64,
    pub long_cluster_distance_pct: Option<f64>,
    pub short_cluster_distance_pct: Option<f64>,
    pub short_cluster_p90_notional: f64,
    pub long_cluster_p90_notional: f64,
    pub swept_liquidation_zone_low: Option<f64>,
    pub swept_liquidation_zone_high: Option<f64>,
    pub score_threshold: f64,
    pub adaptive_score_threshold: f64,
    pub component_threshold: f64,
    pub regime_long_score: f64,
    pub regime_short_score: f64,
    #[serde(flatten)]
    pub funding: FundingOiMeta,
    #[serde(flatten)]
    pub regime_filter: RegimeMeta,
}

impl TrapMeta {
    pub fn regime_score(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.regime_long_score,
            Direction::Short => self.regime_short_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrapSetupEvent {
    pub event_id: String,
    pub ts_ms: i64,
    pub symbol: String,
    pub direction: Direction,
    pub score: f64,
    pub passed: bool,
    pub components: SignalBreakdown,
    pub raw: TrapMeta,
    pub degraded: bool,
    pub degrade_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Layer1: absorption
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AbsorptionBreakdown {
    pub whale_net_flow_long: f64,
    pub whale_net_flow_short: f64,
    pub twap_uniformity_long: f64,
    pub twap_uniformity_short: f64,
    pub cvd_long: f64,
    pub cvd_short: f64,
    pub stablecoin_inflow: f64,
    pub hidden_divergence_long: bool,
    pub hidden_divergence_short: bool,
    pub orderbook_imbalance_long: f64,
    pub orderbook_imbalance_short: f64,
}

impl AbsorptionBreakdown {
    /// (whale, twap, cvd, stablecoin) for one direction
    pub fn for_direction(&self, direction: Direction) -> [f64; 4] {
        match direction {
            Direction::Long => [
                self.whale_net_flow_long,
                self.twap_uniformity_long,
                self.cvd_long,
                self.stablecoin_inflow,
            ],
            Direction::Short => [
                self.whale_net_flow_short,
                self.twap_uniformity_short,
                self.cvd_short,
                self.stablecoin_inflow,
            ],
        }
    }

    pub fn hidden_divergence(&self, direction: Direction) -> bool {
        match direction {
            Direction::Long => self.hidden_divergence_long,
            Direction::Short => self.hidden_divergence_short,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AbsorptionMeta {
    pub trade_count: usize,
    pub whale_trade_count: usize,
    pub whale_net_flow_usd: f64,
    pub twap_interval_cv: Option<f64>,
    pub cvd_delta_usd: f64,
    pub price_delta_pct: f64,
    pub stablecoin_inflow_usd: Option<f64>,
    pub orderbook_imbalance_avg: Option<f64>,
    pub orderbook_tick_count: usize,
    /// Last traded price in the window
    pub current_price: Option<f64>,
    pub source_trap_score: f64,
    pub source_trap_degraded: bool,
    pub source_trap_raw: TrapMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsorptionEvent {
    pub event_id: String,
    pub ts_ms: i64,
    pub symbol: String,
    pub direction: Direction,
    pub score: f64,
    pub passed: bool,
    pub source_trap_event_id: String,
    pub components: AbsorptionBreakdown,
    pub raw: AbsorptionMeta,
    pub degraded: bool,
    pub degrade_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Layer2: ignition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IgnitionBreakdown {
    pub choch: bool,
    pub order_block: bool,
    pub absorption_strength: bool,
    pub trap_strength: bool,
    pub momentum: bool,
    pub confirmations: usize,
}

/// Output of a structure detector for one direction
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructureSignal {
    pub choch: bool,
    pub order_block: bool,
    pub meta: StructureMeta,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructureMeta {
    /// `heuristic`, `disabled` or `error`
    pub backend: String,
    pub note: Option<String>,
    pub recent_high: Option<f64>,
    pub recent_low: Option<f64>,
    pub nearest_ob_above: Option<f64>,
    pub nearest_ob_below: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IgnitionMeta {
    pub min_confirmations: usize,
    pub confirmations: usize,
    pub absorption_score: f64,
    pub momentum_return_pct: Option<f64>,
    pub source_trap_score: f64,
    pub smc_backend: String,
    pub smc_meta: StructureMeta,
    /// Explicit entry override, when a producer supplies one
    pub entry: Option<f64>,
    /// Last candle close at scoring time
    pub current_price: Option<f64>,
    pub swept_liquidation_zone_low: Option<f64>,
    pub swept_liquidation_zone_high: Option<f64>,
    pub nearest_ob_above: Option<f64>,
    pub nearest_ob_below: Option<f64>,
    pub source_absorption_degraded: bool,
    pub source_absorption_raw: AbsorptionMeta,
    pub source_absorption_components: AbsorptionBreakdown,
}

impl IgnitionMeta {
    pub fn source_trap_raw(&self) -> &TrapMeta {
        &self.source_absorption_raw.source_trap_raw
    }

    /// True when any stage of the causal chain was degraded
    pub fn chain_degraded(&self) -> bool {
        self.source_absorption_degraded || self.source_absorption_raw.source_trap_degraded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePumpEvent {
    pub event_id: String,
    pub ts_ms: i64,
    pub symbol: String,
    pub direction: Direction,
    pub score: f64,
    pub passed: bool,
    pub source_absorption_event_id: String,
    pub source_trap_event_id: String,
    pub components: IgnitionBreakdown,
    pub raw: IgnitionMeta,
    pub degraded: bool,
    pub degrade_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Layer3: execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub entry: f64,
    pub sl: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub rr: f64,
    pub sl_pct: f64,
    pub tp1_pct: f64,
    pub tp2_pct: f64,
    pub quantity: f64,
    pub risk_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderIds {
    pub entry: String,
    pub sl: String,
    pub tp1: String,
    pub tp2: String,
}

impl OrderIds {
    pub fn paper() -> Self {
        Self {
            entry: "paper-entry".to_string(),
            sl: "paper-sl".to_string(),
            tp1: "paper-tp1".to_string(),
            tp2: "paper-tp2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionMeta {
    pub execution_mode: String,
    pub source_pre_pump_score: f64,
    pub source_pre_pump_confirmations: usize,
    pub size_multiplier: f64,
    /// Raw exchange responses keyed by leg, or `{"mode": "paper"}`
    pub execution_raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_id: String,
    pub ts_ms: i64,
    pub symbol: String,
    pub direction: Direction,
    pub passed: bool,
    pub source_pre_pump_event_id: String,
    pub plan: ExecutionPlan,
    pub order_ids: OrderIds,
    pub raw: ExecutionMeta,
    pub degraded: bool,
    pub degrade_reason: Option<String>,
}

/// Result of one scoring cycle. Degradation travels on the emitted event.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome<E> {
    /// Preconditions not met (warmup, no price, no upstream event, too few trades)
    Skipped(&'static str),
    /// Scored, gate failed
    Rejected,
    Emit(E),
}

impl<E> CycleOutcome<E> {
    pub fn into_event(self) -> Option<E> {
        match self {
            CycleOutcome::Emit(event) => Some(event),
            _ => None,
        }
    }
}

/// Canonical flattenable representation shared by every event type
pub trait PipelineEvent: Serialize {
    fn event_type(&self) -> &'static str;
    fn event_id(&self) -> &str;
    fn ts_ms(&self) -> i64;

    /// Nested map of primitive values, tagged with the event type
    fn to_flat_map(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "event_type".to_string(),
                serde_json::Value::String(self.event_type().to_string()),
            );
        }
        value
    }
}

macro_rules! pipeline_event {
    ($ty:ty, $name:literal) => {
        impl PipelineEvent for $ty {
            fn event_type(&self) -> &'static str {
                $name
            }
            fn event_id(&self) -> &str {
                &self.event_id
            }
            fn ts_ms(&self) -> i64 {
                self.ts_ms
            }
        }
    };
}

pipeline_event!(TrapSetupEvent, "TRAP_SETUP_EVENT");
pipeline_event!(AbsorptionEvent, "ABSORPTION_EVENT");
pipeline_event!(PrePumpEvent, "PRE_PUMP_EVENT");
pipeline_event!(ExecutionEvent, "EXECUTION_EVENT");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_serde() {
        assert_eq!(serde_json::to_string(&Direction::Long).unwrap(), r#""LONG""#);
        let parsed: Direction = serde_json::from_str(r#""SHORT""#).unwrap();
        assert_eq!(parsed, Direction::Short);
    }

    #[test]
    fn test_join_reasons_dedups_and_sorts() {
        let reasons = vec![
            "OKX_STALE".to_string(),
            "BYBIT_403".to_string(),
            "OKX_STALE".to_string(),
        ];
        assert_eq!(join_reasons(&reasons).as_deref(), Some("BYBIT_403|OKX_STALE"));
        assert_eq!(join_reasons(&[]), None);
    }

    #[test]
    fn test_breakdown_for_direction() {
        let breakdown = SignalBreakdown {
            liquidation_long: 0.9,
            liquidation_short: 0.1,
            funding_oi_long: 0.8,
            funding_oi_short: 0.2,
            oi_divergence: 0.5,
        };
        assert_eq!(breakdown.for_direction(Direction::Long), [0.9, 0.8, 0.5]);
        assert_eq!(breakdown.for_direction(Direction::Short), [0.1, 0.2, 0.5]);
    }

    #[test]
    fn test_flat_map_is_nested_primitive_object() {
        let event = TrapSetupEvent {
            event_id: "trap-1".to_string(),
            ts_ms: 1,
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            score: 0.8,
            passed: true,
            components: SignalBreakdown::default(),
            raw: TrapMeta {
                current_price: 62_959.0,
                ..Default::default()
            },
            degraded: false,
            degrade_reason: None,
        };
        let flat = event.to_flat_map();
        assert_eq!(flat["event_type"], "TRAP_SETUP_EVENT");
        assert_eq!(flat["direction"], "LONG");
        assert_eq!(flat["raw"]["current_price"], 62_959.0);
        // Flattened diagnostics sit beside the trap fields
        assert!(flat["raw"].get("avg_funding").is_some());
        assert!(flat["raw"].get("regime_state").is_some());
    }
}
