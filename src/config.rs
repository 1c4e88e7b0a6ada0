//! Configuration loading and validation
//!
//! One nested section per layer plus shared endpoints. Every field has a
//! default so an empty file (or no file at all) yields a runnable paper
//! configuration. Environment overrides use the `PHANTOM__` prefix, e.g.
//! `PHANTOM__LAYER0__CADENCE_SECONDS=5`.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

lazy_static! {
    static ref SYMBOL_RE: Regex = Regex::new(r"^[A-Z0-9]{2,20}$").expect("static regex");
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub endpoints: ExchangeEndpoints,
    #[serde(default)]
    pub layer0: Layer0Config,
    #[serde(default)]
    pub layer1: Layer1Config,
    #[serde(default)]
    pub layer2: Layer2Config,
    #[serde(default)]
    pub layer3: Layer3Config,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Exponential backoff bounds shared by every poller and stream worker
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_min")]
    pub min_seconds: f64,
    #[serde(default = "default_backoff_max")]
    pub max_seconds: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_seconds: default_backoff_min(),
            max_seconds: default_backoff_max(),
        }
    }
}

impl BackoffConfig {
    pub fn min(&self) -> Duration {
        secs(self.min_seconds)
    }

    pub fn max(&self) -> Duration {
        secs(self.max_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeEndpoints {
    #[serde(default = "default_binance_rest")]
    pub binance_rest: String,
    #[serde(default = "default_binance_ws")]
    pub binance_ws: String,
    #[serde(default = "default_binance_trade_ws")]
    pub binance_trade_ws: String,
    #[serde(default = "default_bybit_rest")]
    pub bybit_rest: String,
    #[serde(default = "default_bybit_ws")]
    pub bybit_ws: String,
    #[serde(default = "default_okx_rest")]
    pub okx_rest: String,
    #[serde(default = "default_whale_alert_rest")]
    pub whale_alert_rest: String,
    #[serde(default = "default_telegram_api")]
    pub telegram_api: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_seconds: f64,
}

impl Default for ExchangeEndpoints {
    fn default() -> Self {
        Self {
            binance_rest: default_binance_rest(),
            binance_ws: default_binance_ws(),
            binance_trade_ws: default_binance_trade_ws(),
            bybit_rest: default_bybit_rest(),
            bybit_ws: default_bybit_ws(),
            okx_rest: default_okx_rest(),
            whale_alert_rest: default_whale_alert_rest(),
            telegram_api: default_telegram_api(),
            http_timeout_seconds: default_http_timeout_secs(),
        }
    }
}

impl ExchangeEndpoints {
    pub fn http_timeout(&self) -> Duration {
        secs(self.http_timeout_seconds)
    }
}

// ---------------------------------------------------------------------------
// Layer0
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SignalWeights {
    #[serde(default = "default_w_liquidation")]
    pub liquidation: f64,
    #[serde(default = "default_w_funding_oi")]
    pub funding_oi: f64,
    #[serde(default = "default_w_oi_divergence")]
    pub oi_divergence: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            liquidation: default_w_liquidation(),
            funding_oi: default_w_funding_oi(),
            oi_divergence: default_w_oi_divergence(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_l0_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_component_threshold")]
    pub component_threshold: f64,
    #[serde(default = "default_oi_div_spread_floor")]
    pub oi_div_spread_floor: f64,
    #[serde(default = "default_oi_div_spread_span")]
    pub oi_div_spread_span: f64,
    #[serde(default = "default_rv_low_vol_threshold")]
    pub rv_low_vol_threshold: f64,
    #[serde(default = "default_compression_return_cap")]
    pub compression_return_cap: f64,
    #[serde(default = "default_funding_scale")]
    pub funding_scale: f64,
    #[serde(default = "default_oi_pct_scale")]
    pub oi_pct_scale: f64,
    #[serde(default = "default_oi_accel_scale")]
    pub oi_accel_scale: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_l0_score_threshold(),
            component_threshold: default_component_threshold(),
            oi_div_spread_floor: default_oi_div_spread_floor(),
            oi_div_spread_span: default_oi_div_spread_span(),
            rv_low_vol_threshold: default_rv_low_vol_threshold(),
            compression_return_cap: default_compression_return_cap(),
            funding_scale: default_funding_scale(),
            oi_pct_scale: default_oi_pct_scale(),
            oi_accel_scale: default_oi_accel_scale(),
        }
    }
}

/// Trend/volatility veto applied per direction
#[derive(Debug, Clone, Deserialize)]
pub struct RegimeFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_regime_min_score")]
    pub min_score: f64,
    #[serde(default = "default_trend_ema_fast")]
    pub trend_ema_fast: usize,
    #[serde(default = "default_trend_ema_slow")]
    pub trend_ema_slow: usize,
    #[serde(default = "default_trend_gap_scale_pct")]
    pub trend_gap_scale_pct: f64,
    #[serde(default = "default_max_abs_ret_5m")]
    pub max_abs_ret_5m: f64,
    #[serde(default = "default_panic_vol_cutoff")]
    pub panic_vol_cutoff: f64,
}

impl Default for RegimeFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_score: default_regime_min_score(),
            trend_ema_fast: default_trend_ema_fast(),
            trend_ema_slow: default_trend_ema_slow(),
            trend_gap_scale_pct: default_trend_gap_scale_pct(),
            max_abs_ret_5m: default_max_abs_ret_5m(),
            panic_vol_cutoff: default_panic_vol_cutoff(),
        }
    }
}

/// Rolling-quantile threshold that tightens with recent score levels
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveGateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_cycles")]
    pub window_cycles: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_quantile")]
    pub quantile: f64,
    #[serde(default = "default_adaptive_floor")]
    pub floor: f64,
    #[serde(default = "default_adaptive_ceiling")]
    pub ceiling: f64,
}

impl Default for AdaptiveGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_cycles: default_window_cycles(),
            min_samples: default_min_samples(),
            quantile: default_quantile(),
            floor: default_adaptive_floor(),
            ceiling: default_adaptive_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer0Config {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_l0_cadence")]
    pub cadence_seconds: f64,
    #[serde(default = "default_l0_rest_poll")]
    pub rest_poll_interval_seconds: f64,
    #[serde(default = "default_snapshot_staleness")]
    pub snapshot_staleness_seconds: f64,
    #[serde(default = "default_warmup_minutes")]
    pub warmup_minutes: f64,
    #[serde(default = "default_cluster_window_minutes")]
    pub cluster_window_minutes: f64,
    #[serde(default = "default_cluster_bin_size")]
    pub cluster_bin_size: f64,
    #[serde(default = "default_cluster_decay_minutes")]
    pub cluster_decay_minutes: f64,
    #[serde(default = "default_oi_history_max_age_minutes")]
    pub oi_history_max_age_minutes: f64,
    #[serde(default = "default_price_history_max_age_minutes")]
    pub price_history_max_age_minutes: f64,
    #[serde(default = "default_true")]
    pub enable_binance: bool,
    #[serde(default = "default_true")]
    pub enable_bybit: bool,
    #[serde(default = "default_true")]
    pub enable_okx: bool,
    #[serde(default)]
    pub enable_okx_liquidations: bool,
    #[serde(default)]
    pub weights: SignalWeights,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub regime: RegimeFilterConfig,
    #[serde(default)]
    pub adaptive_gate: AdaptiveGateConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for Layer0Config {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            cadence_seconds: default_l0_cadence(),
            rest_poll_interval_seconds: default_l0_rest_poll(),
            snapshot_staleness_seconds: default_snapshot_staleness(),
            warmup_minutes: default_warmup_minutes(),
            cluster_window_minutes: default_cluster_window_minutes(),
            cluster_bin_size: default_cluster_bin_size(),
            cluster_decay_minutes: default_cluster_decay_minutes(),
            oi_history_max_age_minutes: default_oi_history_max_age_minutes(),
            price_history_max_age_minutes: default_price_history_max_age_minutes(),
            enable_binance: true,
            enable_bybit: true,
            enable_okx: true,
            enable_okx_liquidations: false,
            weights: SignalWeights::default(),
            thresholds: ThresholdConfig::default(),
            regime: RegimeFilterConfig::default(),
            adaptive_gate: AdaptiveGateConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Layer0Config {
    pub fn cadence(&self) -> Duration {
        secs(self.cadence_seconds)
    }

    pub fn rest_poll_interval(&self) -> Duration {
        secs(self.rest_poll_interval_seconds)
    }

    pub fn staleness_ms(&self) -> i64 {
        (self.snapshot_staleness_seconds * 1000.0) as i64
    }

    pub fn warmup_ms(&self) -> i64 {
        (self.warmup_minutes * 60_000.0) as i64
    }

    pub fn oi_history_max_age_ms(&self) -> i64 {
        (self.oi_history_max_age_minutes * 60_000.0) as i64
    }

    pub fn price_history_max_age_ms(&self) -> i64 {
        (self.price_history_max_age_minutes * 60_000.0) as i64
    }
}

// ---------------------------------------------------------------------------
// Layer1
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Layer1Weights {
    #[serde(default = "default_w_whale")]
    pub whale_net_flow: f64,
    #[serde(default = "default_w_twap")]
    pub twap_uniformity: f64,
    #[serde(default = "default_w_cvd")]
    pub cvd: f64,
    #[serde(default = "default_w_stablecoin")]
    pub stablecoin_inflow: f64,
}

impl Default for Layer1Weights {
    fn default() -> Self {
        Self {
            whale_net_flow: default_w_whale(),
            twap_uniformity: default_w_twap(),
            cvd: default_w_cvd(),
            stablecoin_inflow: default_w_stablecoin(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer1ThresholdConfig {
    #[serde(default = "default_l1_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_component_threshold")]
    pub component_threshold: f64,
    #[serde(default = "default_whale_notional")]
    pub whale_notional_usd: f64,
    #[serde(default = "default_whale_flow_scale")]
    pub whale_flow_scale_usd: f64,
    #[serde(default = "default_twap_cv_limit")]
    pub twap_interval_cv_limit: f64,
    #[serde(default = "default_cvd_scale")]
    pub cvd_scale_usd: f64,
    #[serde(default = "default_stablecoin_scale")]
    pub stablecoin_inflow_scale_usd: f64,
    #[serde(default = "default_min_component_hits")]
    pub min_component_hits: usize,
}

impl Default for Layer1ThresholdConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_l1_score_threshold(),
            component_threshold: default_component_threshold(),
            whale_notional_usd: default_whale_notional(),
            whale_flow_scale_usd: default_whale_flow_scale(),
            twap_interval_cv_limit: default_twap_cv_limit(),
            cvd_scale_usd: default_cvd_scale(),
            stablecoin_inflow_scale_usd: default_stablecoin_scale(),
            min_component_hits: default_min_component_hits(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhaleAlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_whale_poll")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_min_transfer")]
    pub min_transfer_usd: f64,
}

impl Default for WhaleAlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            poll_interval_seconds: default_whale_poll(),
            min_transfer_usd: default_min_transfer(),
        }
    }
}

impl WhaleAlertConfig {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer1Config {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_l1_cadence")]
    pub cadence_seconds: f64,
    #[serde(default = "default_trade_window")]
    pub trade_window_seconds: f64,
    #[serde(default = "default_setup_ttl")]
    pub setup_ttl_seconds: f64,
    #[serde(default = "default_min_trades")]
    pub min_trades_for_metrics: usize,
    #[serde(default = "default_true")]
    pub enable_binance_trades: bool,
    #[serde(default)]
    pub enable_binance_orderbook: bool,
    #[serde(default)]
    pub thresholds: Layer1ThresholdConfig,
    #[serde(default)]
    pub weights: Layer1Weights,
    #[serde(default)]
    pub whale_alert: WhaleAlertConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for Layer1Config {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            cadence_seconds: default_l1_cadence(),
            trade_window_seconds: default_trade_window(),
            setup_ttl_seconds: default_setup_ttl(),
            min_trades_for_metrics: default_min_trades(),
            enable_binance_trades: true,
            enable_binance_orderbook: false,
            thresholds: Layer1ThresholdConfig::default(),
            weights: Layer1Weights::default(),
            whale_alert: WhaleAlertConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Layer1Config {
    pub fn cadence(&self) -> Duration {
        secs(self.cadence_seconds)
    }

    pub fn trade_window_ms(&self) -> i64 {
        (self.trade_window_seconds * 1000.0) as i64
    }

    pub fn setup_ttl_ms(&self) -> i64 {
        (self.setup_ttl_seconds * 1000.0) as i64
    }
}

// ---------------------------------------------------------------------------
// Layer2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Layer2ThresholdConfig {
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: usize,
    #[serde(default = "default_absorption_score_min")]
    pub absorption_score_min: f64,
    #[serde(default = "default_trap_score_min")]
    pub trap_score_min: f64,
    #[serde(default = "default_momentum_lookback")]
    pub momentum_lookback_bars: usize,
    #[serde(default = "default_momentum_min_return")]
    pub momentum_min_return_pct: f64,
}

impl Default for Layer2ThresholdConfig {
    fn default() -> Self {
        Self {
            min_confirmations: default_min_confirmations(),
            absorption_score_min: default_absorption_score_min(),
            trap_score_min: default_trap_score_min(),
            momentum_lookback_bars: default_momentum_lookback(),
            momentum_min_return_pct: default_momentum_min_return(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer2Config {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_l2_cadence")]
    pub cadence_seconds: f64,
    #[serde(default = "default_l2_rest_poll")]
    pub rest_poll_interval_seconds: f64,
    #[serde(default = "default_setup_ttl")]
    pub setup_ttl_seconds: f64,
    #[serde(default = "default_candle_interval")]
    pub candle_interval: String,
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,
    #[serde(default = "default_true")]
    pub enable_structure_detector: bool,
    #[serde(default)]
    pub thresholds: Layer2ThresholdConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for Layer2Config {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            cadence_seconds: default_l2_cadence(),
            rest_poll_interval_seconds: default_l2_rest_poll(),
            setup_ttl_seconds: default_setup_ttl(),
            candle_interval: default_candle_interval(),
            candle_limit: default_candle_limit(),
            enable_structure_detector: true,
            thresholds: Layer2ThresholdConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Layer2Config {
    pub fn cadence(&self) -> Duration {
        secs(self.cadence_seconds)
    }

    pub fn rest_poll_interval(&self) -> Duration {
        secs(self.rest_poll_interval_seconds)
    }

    pub fn setup_ttl_ms(&self) -> i64 {
        (self.setup_ttl_seconds * 1000.0) as i64
    }
}

// ---------------------------------------------------------------------------
// Layer3
// ---------------------------------------------------------------------------

/// Paper simulates fills; live places orders on Binance USD-M futures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Paper => write!(f, "paper"),
            ExecutionMode::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paper" => Ok(ExecutionMode::Paper),
            "live" => Ok(ExecutionMode::Live),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer3RiskConfig {
    #[serde(default = "default_sl_buffer_pct")]
    pub default_sl_buffer_pct: f64,
    #[serde(default = "default_tp1_r")]
    pub tp1_r_multiple: f64,
    #[serde(default = "default_tp2_r")]
    pub tp2_r_multiple: f64,
    #[serde(default = "default_tp1_quantity_ratio")]
    pub tp1_quantity_ratio: f64,
}

impl Default for Layer3RiskConfig {
    fn default() -> Self {
        Self {
            default_sl_buffer_pct: default_sl_buffer_pct(),
            tp1_r_multiple: default_tp1_r(),
            tp2_r_multiple: default_tp2_r(),
            tp1_quantity_ratio: default_tp1_quantity_ratio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_min_seconds_between_entries")]
    pub min_seconds_between_entries: f64,
    #[serde(default = "default_max_entries_per_hour")]
    pub max_entries_per_hour: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_seconds_between_entries: default_min_seconds_between_entries(),
            max_entries_per_hour: default_max_entries_per_hour(),
        }
    }
}

/// Confidence-scaled quantity multiplier
#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_multiplier")]
    pub min_multiplier: f64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
    #[serde(default = "default_degraded_factor")]
    pub degraded_factor: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_multiplier: default_min_multiplier(),
            max_multiplier: default_max_multiplier(),
            degraded_factor: default_degraded_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BinanceCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer3Config {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_l3_cadence")]
    pub cadence_seconds: f64,
    #[serde(default = "default_setup_ttl")]
    pub pre_pump_ttl_seconds: f64,
    #[serde(default = "default_fixed_quantity")]
    pub fixed_quantity: f64,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_true")]
    pub enable_execution: bool,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default)]
    pub risk: Layer3RiskConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub binance: BinanceCredentials,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for Layer3Config {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            cadence_seconds: default_l3_cadence(),
            pre_pump_ttl_seconds: default_setup_ttl(),
            fixed_quantity: default_fixed_quantity(),
            execution_mode: default_execution_mode(),
            enable_execution: true,
            dedup_capacity: default_dedup_capacity(),
            risk: Layer3RiskConfig::default(),
            guard: GuardConfig::default(),
            sizing: SizingConfig::default(),
            telegram: TelegramConfig::default(),
            binance: BinanceCredentials::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Layer3Config {
    pub fn cadence(&self) -> Duration {
        secs(self.cadence_seconds)
    }

    pub fn pre_pump_ttl_ms(&self) -> i64 {
        (self.pre_pump_ttl_seconds * 1000.0) as i64
    }

    /// True when orders go to the exchange rather than being simulated
    pub fn is_live(&self) -> bool {
        self.enable_execution && self.execution_mode == ExecutionMode::Live
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_health_log_interval")]
    pub health_log_interval_seconds: f64,
}

impl PipelineConfig {
    /// `None` disables the periodic health log
    pub fn health_log_interval(&self) -> Option<Duration> {
        (self.health_log_interval_seconds > 0.0).then(|| secs(self.health_log_interval_seconds))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            health_log_interval_seconds: default_health_log_interval(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_backoff_min() -> f64 {
    2.0
}
fn default_backoff_max() -> f64 {
    60.0
}
fn default_binance_rest() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_binance_ws() -> String {
    "wss://fstream.binance.com/stream?streams=!forceOrder@arr".to_string()
}
fn default_binance_trade_ws() -> String {
    "wss://fstream.binance.com/ws".to_string()
}
fn default_bybit_rest() -> String {
    "https://api.bybit.com".to_string()
}
fn default_bybit_ws() -> String {
    "wss://stream.bybit.com/v5/public/linear".to_string()
}
fn default_okx_rest() -> String {
    "https://www.okx.com".to_string()
}
fn default_whale_alert_rest() -> String {
    "https://api.whale-alert.io/v1".to_string()
}
fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}
fn default_http_timeout_secs() -> f64 {
    10.0
}
fn default_w_liquidation() -> f64 {
    0.40
}
fn default_w_funding_oi() -> f64 {
    0.30
}
fn default_w_oi_divergence() -> f64 {
    0.30
}
fn default_l0_score_threshold() -> f64 {
    0.70
}
fn default_component_threshold() -> f64 {
    0.50
}
fn default_oi_div_spread_floor() -> f64 {
    0.4
}
fn default_oi_div_spread_span() -> f64 {
    1.6
}
fn default_rv_low_vol_threshold() -> f64 {
    0.008
}
fn default_compression_return_cap() -> f64 {
    0.01
}
fn default_funding_scale() -> f64 {
    0.0005
}
fn default_oi_pct_scale() -> f64 {
    1.5
}
fn default_oi_accel_scale() -> f64 {
    1.0
}
fn default_regime_min_score() -> f64 {
    0.45
}
fn default_trend_ema_fast() -> usize {
    12
}
fn default_trend_ema_slow() -> usize {
    48
}
fn default_trend_gap_scale_pct() -> f64 {
    0.002
}
fn default_max_abs_ret_5m() -> f64 {
    0.01
}
fn default_panic_vol_cutoff() -> f64 {
    0.03
}
fn default_window_cycles() -> usize {
    240
}
fn default_min_samples() -> usize {
    40
}
fn default_quantile() -> f64 {
    0.80
}
fn default_adaptive_floor() -> f64 {
    0.70
}
fn default_adaptive_ceiling() -> f64 {
    0.90
}
fn default_l0_cadence() -> f64 {
    15.0
}
fn default_l0_rest_poll() -> f64 {
    15.0
}
fn default_snapshot_staleness() -> f64 {
    45.0
}
fn default_warmup_minutes() -> f64 {
    5.0
}
fn default_cluster_window_minutes() -> f64 {
    90.0
}
fn default_cluster_bin_size() -> f64 {
    100.0
}
fn default_cluster_decay_minutes() -> f64 {
    45.0
}
fn default_oi_history_max_age_minutes() -> f64 {
    180.0
}
fn default_price_history_max_age_minutes() -> f64 {
    120.0
}
fn default_w_whale() -> f64 {
    0.35
}
fn default_w_twap() -> f64 {
    0.20
}
fn default_w_cvd() -> f64 {
    0.30
}
fn default_w_stablecoin() -> f64 {
    0.15
}
fn default_l1_score_threshold() -> f64 {
    0.60
}
fn default_whale_notional() -> f64 {
    100_000.0
}
fn default_whale_flow_scale() -> f64 {
    2_000_000.0
}
fn default_twap_cv_limit() -> f64 {
    0.35
}
fn default_cvd_scale() -> f64 {
    2_000_000.0
}
fn default_stablecoin_scale() -> f64 {
    50_000_000.0
}
fn default_min_component_hits() -> usize {
    2
}
fn default_whale_poll() -> f64 {
    20.0
}
fn default_min_transfer() -> f64 {
    1_000_000.0
}
fn default_l1_cadence() -> f64 {
    1.0
}
fn default_trade_window() -> f64 {
    180.0
}
fn default_setup_ttl() -> f64 {
    180.0
}
fn default_min_trades() -> usize {
    20
}
fn default_min_confirmations() -> usize {
    3
}
fn default_absorption_score_min() -> f64 {
    0.60
}
fn default_trap_score_min() -> f64 {
    0.70
}
fn default_momentum_lookback() -> usize {
    5
}
fn default_momentum_min_return() -> f64 {
    0.0015
}
fn default_l2_cadence() -> f64 {
    2.0
}
fn default_l2_rest_poll() -> f64 {
    3.0
}
fn default_candle_interval() -> String {
    "1m".to_string()
}
fn default_candle_limit() -> usize {
    200
}
fn default_sl_buffer_pct() -> f64 {
    0.0044
}
fn default_tp1_r() -> f64 {
    1.5
}
fn default_tp2_r() -> f64 {
    2.5
}
fn default_tp1_quantity_ratio() -> f64 {
    0.5
}
fn default_min_seconds_between_entries() -> f64 {
    300.0
}
fn default_max_entries_per_hour() -> usize {
    6
}
fn default_min_multiplier() -> f64 {
    0.5
}
fn default_max_multiplier() -> f64 {
    1.5
}
fn default_degraded_factor() -> f64 {
    0.7
}
fn default_l3_cadence() -> f64 {
    1.0
}
fn default_fixed_quantity() -> f64 {
    0.001
}
fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Paper
}
fn default_dedup_capacity() -> usize {
    4000
}
fn default_queue_capacity() -> usize {
    200
}
fn default_health_log_interval() -> f64 {
    300.0
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl Config {
    /// Load configuration from file and environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix PHANTOM__)
            .add_source(
                config::Environment::with_prefix("PHANTOM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Point every layer at the same symbol
    pub fn set_symbol(&mut self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        self.layer0.symbol = symbol.clone();
        self.layer1.symbol = symbol.clone();
        self.layer2.symbol = symbol.clone();
        self.layer3.symbol = symbol;
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for symbol in [
            &self.layer0.symbol,
            &self.layer1.symbol,
            &self.layer2.symbol,
            &self.layer3.symbol,
        ] {
            if !SYMBOL_RE.is_match(symbol) {
                anyhow::bail!("Invalid symbol: {}", symbol);
            }
        }

        if self.pipeline.queue_capacity == 0 {
            anyhow::bail!("pipeline.queue_capacity must be at least 1");
        }

        // Cadences
        for (name, value) in [
            ("layer0.cadence_seconds", self.layer0.cadence_seconds),
            ("layer0.rest_poll_interval_seconds", self.layer0.rest_poll_interval_seconds),
            ("layer1.cadence_seconds", self.layer1.cadence_seconds),
            ("layer2.cadence_seconds", self.layer2.cadence_seconds),
            ("layer2.rest_poll_interval_seconds", self.layer2.rest_poll_interval_seconds),
            ("layer3.cadence_seconds", self.layer3.cadence_seconds),
        ] {
            if value <= 0.0 {
                anyhow::bail!("{} must be positive", name);
            }
        }

        for (name, backoff) in [
            ("layer0", &self.layer0.backoff),
            ("layer1", &self.layer1.backoff),
            ("layer2", &self.layer2.backoff),
            ("layer3", &self.layer3.backoff),
        ] {
            if backoff.min_seconds <= 0.0 || backoff.min_seconds > backoff.max_seconds {
                anyhow::bail!(
                    "{}.backoff: min_seconds ({}) must be positive and <= max_seconds ({})",
                    name,
                    backoff.min_seconds,
                    backoff.max_seconds
                );
            }
        }

        // Weights
        let w0 = &self.layer0.weights;
        validate_weights("layer0.weights", &[w0.liquidation, w0.funding_oi, w0.oi_divergence])?;
        let w1 = &self.layer1.weights;
        validate_weights(
            "layer1.weights",
            &[w1.whale_net_flow, w1.twap_uniformity, w1.cvd, w1.stablecoin_inflow],
        )?;

        // Unit-interval thresholds
        for (name, value) in [
            ("layer0.thresholds.score_threshold", self.layer0.thresholds.score_threshold),
            ("layer0.thresholds.component_threshold", self.layer0.thresholds.component_threshold),
            ("layer0.regime.min_score", self.layer0.regime.min_score),
            ("layer0.adaptive_gate.quantile", self.layer0.adaptive_gate.quantile),
            ("layer1.thresholds.score_threshold", self.layer1.thresholds.score_threshold),
            ("layer1.thresholds.component_threshold", self.layer1.thresholds.component_threshold),
            ("layer2.thresholds.absorption_score_min", self.layer2.thresholds.absorption_score_min),
            ("layer2.thresholds.trap_score_min", self.layer2.thresholds.trap_score_min),
            ("layer3.risk.tp1_quantity_ratio", self.layer3.risk.tp1_quantity_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within [0, 1], got {}", name, value);
            }
        }

        let gate = &self.layer0.adaptive_gate;
        if gate.floor > gate.ceiling {
            anyhow::bail!(
                "layer0.adaptive_gate.floor ({}) cannot exceed ceiling ({})",
                gate.floor,
                gate.ceiling
            );
        }

        if self.layer0.cluster_bin_size <= 0.0 || self.layer0.cluster_decay_minutes <= 0.0 {
            anyhow::bail!("layer0 cluster_bin_size and cluster_decay_minutes must be positive");
        }

        if self.layer2.thresholds.min_confirmations > 5 {
            anyhow::bail!("layer2.thresholds.min_confirmations cannot exceed 5");
        }

        let l3 = &self.layer3;
        if l3.fixed_quantity <= 0.0 {
            anyhow::bail!("layer3.fixed_quantity must be positive");
        }
        if l3.risk.tp1_r_multiple <= 0.0 || l3.risk.tp2_r_multiple <= 0.0 {
            anyhow::bail!("layer3 R multiples must be positive");
        }
        if l3.sizing.min_multiplier <= 0.0 || l3.sizing.min_multiplier > l3.sizing.max_multiplier {
            anyhow::bail!("layer3.sizing: min_multiplier must be positive and <= max_multiplier");
        }

        Ok(())
    }

    /// Startup checks for credentials the selected mode needs
    pub fn validate_credentials(&self) -> Result<()> {
        let l3 = &self.layer3;
        if l3.is_live() && (l3.binance.api_key.is_empty() || l3.binance.api_secret.is_empty()) {
            anyhow::bail!("BINANCE_API_KEY/BINANCE_API_SECRET are required for live execution");
        }
        if l3.telegram.enabled && (l3.telegram.bot_token.is_empty() || l3.telegram.chat_id.is_empty()) {
            anyhow::bail!("TG_BOT_TOKEN and TG_CHAT_ID are required for telegram notifications");
        }
        if self.layer1.whale_alert.enabled && self.layer1.whale_alert.api_key.is_empty() {
            tracing::warn!("Whale Alert enabled without an API key - stablecoin inflow will stay degraded");
        }
        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Symbol: {}
  Layer0:
    cadence: {}s, rest_poll: {}s, staleness: {}s, warmup: {}min
    exchanges: binance={} bybit={} okx={} (okx liquidations={})
    score_threshold: {}, adaptive_gate: {} (q={}, floor={}, ceiling={})
    regime_filter: {} (min_score={})
  Layer1:
    cadence: {}s, trade_window: {}s, setup_ttl: {}s, min_trades: {}
    orderbook: {}, whale_alert: {} (api_key: {})
  Layer2:
    cadence: {}s, candles: {} x {}, structure_detector: {}
  Layer3:
    mode: {}, execution: {}, quantity: {}
    guard: {}s between entries, {} per hour
    binance api_key: {}, api_secret: {}
    telegram: {} (bot_token: {}, chat_id: {})
  Pipeline:
    queue_capacity: {}
"#,
            self.layer0.symbol,
            self.layer0.cadence_seconds,
            self.layer0.rest_poll_interval_seconds,
            self.layer0.snapshot_staleness_seconds,
            self.layer0.warmup_minutes,
            self.layer0.enable_binance,
            self.layer0.enable_bybit,
            self.layer0.enable_okx,
            self.layer0.enable_okx_liquidations,
            self.layer0.thresholds.score_threshold,
            self.layer0.adaptive_gate.enabled,
            self.layer0.adaptive_gate.quantile,
            self.layer0.adaptive_gate.floor,
            self.layer0.adaptive_gate.ceiling,
            self.layer0.regime.enabled,
            self.layer0.regime.min_score,
            self.layer1.cadence_seconds,
            self.layer1.trade_window_seconds,
            self.layer1.setup_ttl_seconds,
            self.layer1.min_trades_for_metrics,
            self.layer1.enable_binance_orderbook,
            self.layer1.whale_alert.enabled,
            mask_secret(&self.layer1.whale_alert.api_key),
            self.layer2.cadence_seconds,
            self.layer2.candle_limit,
            self.layer2.candle_interval,
            self.layer2.enable_structure_detector,
            self.layer3.execution_mode,
            self.layer3.enable_execution,
            self.layer3.fixed_quantity,
            self.layer3.guard.min_seconds_between_entries,
            self.layer3.guard.max_entries_per_hour,
            mask_secret(&self.layer3.binance.api_key),
            mask_secret(&self.layer3.binance.api_secret),
            self.layer3.telegram.enabled,
            mask_secret(&self.layer3.telegram.bot_token),
            mask_secret(&self.layer3.telegram.chat_id),
            self.pipeline.queue_capacity,
        )
    }
}

fn validate_weights(name: &str, weights: &[f64]) -> Result<()> {
    if weights.iter().any(|w| *w < 0.0) {
        anyhow::bail!("{} cannot contain negative weights", name);
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        anyhow::bail!("{} must sum to a positive value", name);
    }
    Ok(())
}

/// Mask secrets for display
fn mask_secret(value: &str) -> &'static str {
    if value.is_empty() {
        "(not set)"
    } else {
        "***"
    }
}
