//! Layer0 trap setup detector
//!
//! One snapshot poller and one liquidation worker per exchange feed a
//! shared rolling state; a single scoring loop reads it every cadence tick
//! and emits a `TrapSetupEvent` when either direction clears the gate.

use futures::future::join_all;
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::liquidation_book::LiquidationBook;
use super::signals;
use crate::config::Layer0Config;
use crate::error::{Error, Result};
use crate::exchange::ExchangeClient;
use crate::health::HealthCounters;
use crate::stream::{sleep_or_stop, Backoff, EventSender};
use crate::types::{
    join_reasons, new_event_id, now_ms, CycleOutcome, Direction, ExchangeSnapshot, OIObservation,
    SignalBreakdown, TrapMeta, TrapSetupEvent,
};

const RV_POINTS: usize = 60;
const RETURN_LOOKBACK_POINTS: usize = 5;
const REGIME_POINTS: usize = 180;

#[derive(Debug, Default)]
struct ExchangeState {
    snapshot: Option<ExchangeSnapshot>,
    oi_history: VecDeque<OIObservation>,
    last_error: Option<String>,
}

/// Rolling market state written by the workers and read by the scorer
#[derive(Debug)]
pub struct SharedState {
    exchanges: BTreeMap<String, ExchangeState>,
    /// (ts_ms, mark price) across every venue
    price_history: VecDeque<(i64, f64)>,
    book: LiquidationBook,
}

impl SharedState {
    fn new<'a>(config: &Layer0Config, names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            exchanges: names
                .into_iter()
                .map(|name| (name.to_string(), ExchangeState::default()))
                .collect(),
            price_history: VecDeque::new(),
            book: LiquidationBook::from_config(config),
        }
    }

    fn record_snapshot(&mut self, snapshot: ExchangeSnapshot, oi_max_age_ms: i64, price_max_age_ms: i64) {
        let ts_ms = snapshot.ts_ms;

        if let Some(price) = snapshot.mark_price.filter(|p| *p > 0.0) {
            self.price_history.push_back((ts_ms, price));
            let cutoff = ts_ms - price_max_age_ms;
            while self.price_history.front().is_some_and(|(ts, _)| *ts < cutoff) {
                self.price_history.pop_front();
            }
        }

        let state = self.exchanges.entry(snapshot.exchange.clone()).or_default();
        if let Some(open_interest) = snapshot.open_interest {
            state.oi_history.push_back(OIObservation { ts_ms, open_interest });
            let cutoff = ts_ms - oi_max_age_ms;
            while state.oi_history.front().is_some_and(|row| row.ts_ms < cutoff) {
                state.oi_history.pop_front();
            }
        }
        state.last_error = None;
        state.snapshot = Some(snapshot);
    }

    fn record_error(&mut self, name: &str, reason: String) {
        self.exchanges.entry(name.to_string()).or_default().last_error = Some(reason);
    }
}

/// Scoring half of Layer0; owns the adaptive score history
pub struct TrapDetector {
    config: Layer0Config,
    state: Arc<RwLock<SharedState>>,
    score_history: VecDeque<f64>,
}

impl TrapDetector {
    pub fn new<'a>(config: Layer0Config, exchange_names: impl IntoIterator<Item = &'a str>) -> Self {
        let state = SharedState::new(&config, exchange_names);
        let window = config.adaptive_gate.window_cycles.max(1);
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            score_history: VecDeque::with_capacity(window),
        }
    }

    pub fn shared_state(&self) -> Arc<RwLock<SharedState>> {
        self.state.clone()
    }

    fn remember_score(&mut self, score: f64) {
        if self.score_history.len() >= self.config.adaptive_gate.window_cycles.max(1) {
            self.score_history.pop_front();
        }
        self.score_history.push_back(score);
    }

    /// Score the current state once at `now_ms`
    pub async fn score_cycle(&mut self, now_ms: i64, health: &HealthCounters) -> CycleOutcome<TrapSetupEvent> {
        let config = &self.config;
        let mut guard = self.state.write().await;
        let SharedState {
            exchanges,
            price_history,
            book,
        } = &mut *guard;

        if !signals::has_warmup_window(exchanges.values().map(|s| &s.oi_history), now_ms, config.warmup_ms()) {
            return CycleOutcome::Skipped("warmup");
        }

        let mut reasons: Vec<String> = Vec::new();
        let mut any_stale = false;
        let mut active: BTreeMap<&str, &ExchangeSnapshot> = BTreeMap::new();
        let mut funding_rates = Vec::new();
        let mut oi_changes_pct = BTreeMap::new();
        let mut oi_accel_pct = BTreeMap::new();

        for (name, state) in exchanges.iter() {
            let Some(snapshot) = state.snapshot.as_ref() else {
                reasons.push(format!("{}_NO_SNAPSHOT", name.to_uppercase()));
                reasons.extend(state.last_error.clone());
                continue;
            };
            if now_ms - snapshot.ts_ms > config.staleness_ms() {
                any_stale = true;
                reasons.push(format!("{}_STALE", name.to_uppercase()));
                reasons.extend(state.last_error.clone());
                continue;
            }

            active.insert(name.as_str(), snapshot);
            funding_rates.extend(snapshot.funding_rate);
            if let Some(change) = signals::compute_oi_pct_change(&state.oi_history, now_ms, signals::OI_WINDOW_MS) {
                oi_changes_pct.insert(name.clone(), change);
            }
            if let Some(accel) = signals::compute_oi_acceleration(&state.oi_history, now_ms) {
                oi_accel_pct.insert(name.clone(), accel);
            }
        }

        if any_stale {
            health.increment_stale_cycles();
        }

        let missing: Vec<&String> = exchanges.keys().filter(|name| !active.contains_key(name.as_str())).collect();
        let mut degraded = !missing.is_empty();
        reasons.extend(missing.iter().map(|name| format!("{}_INACTIVE", name.to_uppercase())));

        let current_price = match active.get("binance").and_then(|s| s.mark_price) {
            Some(price) => price,
            None => {
                let marks: Vec<f64> = active.values().filter_map(|s| s.mark_price).collect();
                if marks.is_empty() {
                    0.0
                } else {
                    marks.iter().sum::<f64>() / marks.len() as f64
                }
            }
        };
        if current_price <= 0.0 {
            return CycleOutcome::Skipped("no_price");
        }

        let prices: Vec<f64> = price_history.iter().map(|(_, price)| *price).collect();
        let tail = |len: usize| &prices[prices.len().saturating_sub(len)..];
        let rv_1h = signals::compute_realized_volatility(tail(RV_POINTS));
        let ret_5m = signals::compute_return(&prices, RETURN_LOOKBACK_POINTS);
        let (regime_long, regime_short, regime_meta) =
            signals::compute_regime_scores(tail(REGIME_POINTS), rv_1h, ret_5m, &config.regime);

        let observed: Vec<f64> = self.score_history.iter().copied().collect();
        let adaptive_threshold =
            signals::compute_adaptive_threshold(&observed, &config.adaptive_gate, config.thresholds.score_threshold);

        let proximity = book.proximity_scores(current_price, now_ms);
        let zones = book.swept_zones(current_price, now_ms);

        let changes: Vec<f64> = oi_changes_pct.values().copied().collect();
        let accels: Vec<f64> = oi_accel_pct.values().copied().collect();
        let (oi_divergence, spread) = signals::compute_oi_divergence_score(
            &changes,
            config.thresholds.oi_div_spread_floor,
            config.thresholds.oi_div_spread_span,
        );
        if changes.len() < 2 {
            degraded = true;
            reasons.push("INSUFFICIENT_EXCHANGES_FOR_DIVERGENCE".to_string());
        }

        let (funding_long, funding_short, funding_meta) =
            signals::compute_funding_oi_scores(&funding_rates, &changes, &accels, rv_1h, ret_5m, &config.thresholds);

        let breakdown = SignalBreakdown {
            liquidation_long: proximity.long_score,
            liquidation_short: proximity.short_score,
            funding_oi_long: funding_long,
            funding_oi_short: funding_short,
            oi_divergence,
        };
        let score_long = signals::compute_directional_score(&breakdown, Direction::Long, &config.weights);
        let score_short = signals::compute_directional_score(&breakdown, Direction::Short, &config.weights);
        let mut long_pass = signals::passes_gate(
            &breakdown,
            Direction::Long,
            score_long,
            &config.thresholds,
            Some(adaptive_threshold),
        );
        let mut short_pass = signals::passes_gate(
            &breakdown,
            Direction::Short,
            score_short,
            &config.thresholds,
            Some(adaptive_threshold),
        );

        if config.regime.enabled {
            long_pass &= regime_long >= config.regime.min_score;
            short_pass &= regime_short >= config.regime.min_score;
        }

        debug!(
            price = current_price,
            score_long,
            score_short,
            threshold = adaptive_threshold,
            long_pass,
            short_pass,
            "Layer0 cycle scored"
        );

        let outcome = if long_pass || short_pass {
            let (direction, score, secondary) = if short_pass && score_short > score_long {
                (Direction::Short, score_short, score_long)
            } else {
                (Direction::Long, score_long, score_short)
            };

            let raw = TrapMeta {
                active_exchanges: active.keys().map(|name| name.to_string()).collect(),
                oi_spread_pct: spread,
                oi_changes_pct,
                oi_accel_pct,
                current_price,
                long_score: score_long,
                short_score: score_short,
                secondary_score: secondary,
                long_cluster_distance_pct: proximity.long_distance_pct,
                short_cluster_distance_pct: proximity.short_distance_pct,
                short_cluster_p90_notional: proximity.short_cluster_p90,
                long_cluster_p90_notional: proximity.long_cluster_p90,
                swept_liquidation_zone_low: zones.low,
                swept_liquidation_zone_high: zones.high,
                score_threshold: config.thresholds.score_threshold,
                adaptive_score_threshold: adaptive_threshold,
                component_threshold: config.thresholds.component_threshold,
                regime_long_score: regime_long,
                regime_short_score: regime_short,
                funding: funding_meta,
                regime_filter: regime_meta,
            };

            CycleOutcome::Emit(TrapSetupEvent {
                event_id: new_event_id(),
                ts_ms: now_ms,
                symbol: config.symbol.clone(),
                direction,
                score,
                passed: true,
                components: breakdown,
                raw,
                degraded,
                degrade_reason: join_reasons(&reasons),
            })
        } else {
            CycleOutcome::Rejected
        };

        drop(guard);
        self.remember_score(score_long.max(score_short));
        outcome
    }
}

async fn snapshot_poller(
    client: Arc<dyn ExchangeClient>,
    config: Layer0Config,
    state: Arc<RwLock<SharedState>>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) {
    let name = client.name().to_string();
    let mut backoff = Backoff::from_config(&config.backoff);

    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = client.fetch_snapshot(&config.symbol) => result,
        };

        let delay = match result {
            Ok(snapshot) => {
                state.write().await.record_snapshot(
                    snapshot,
                    config.oi_history_max_age_ms(),
                    config.price_history_max_age_ms(),
                );
                backoff.reset();
                config.rest_poll_interval()
            }
            Err(e) => {
                let reason = e.reason_for(&name);
                warn!(exchange = %name, reason = %reason, "Snapshot poll failed: {}", e);
                state.write().await.record_error(&name, reason);
                health.increment_reconnect(&name);
                backoff.next_delay()
            }
        };

        if sleep_or_stop(&stop, delay).await {
            return;
        }
    }
}

async fn consume_liquidations(
    client: &dyn ExchangeClient,
    symbol: &str,
    state: &RwLock<SharedState>,
    backoff: &mut Backoff,
) -> Result<()> {
    let mut stream = client.stream_liquidations(symbol).await?;
    backoff.reset();
    while let Some(update) = stream.next().await {
        state.write().await.book.add(update?);
    }
    Ok(())
}

async fn liquidation_worker(
    client: Arc<dyn ExchangeClient>,
    config: Layer0Config,
    state: Arc<RwLock<SharedState>>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) {
    let name = client.name().to_string();
    let mut backoff = Backoff::from_config(&config.backoff);

    loop {
        let outcome = tokio::select! {
            _ = stop.cancelled() => return,
            outcome = consume_liquidations(client.as_ref(), &config.symbol, &state, &mut backoff) => outcome,
        };
        let error = match outcome {
            Ok(()) => Error::StreamEnded(format!("{} liquidation", name)),
            Err(e) => e,
        };
        warn!(exchange = %name, "Liquidation stream dropped: {}", error);
        health.increment_reconnect(&name);

        if sleep_or_stop(&stop, backoff.next_delay()).await {
            return;
        }
    }
}

/// Run Layer0 until `stop` fires
pub async fn run_layer0(
    config: Layer0Config,
    clients: Vec<Arc<dyn ExchangeClient>>,
    out: EventSender<TrapSetupEvent>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) -> Result<()> {
    if clients.is_empty() {
        return Err(Error::Config("layer0 needs at least one exchange client".to_string()));
    }

    let mut detector = TrapDetector::new(config.clone(), clients.iter().map(|c| c.name()));
    let state = detector.shared_state();

    let mut workers = Vec::new();
    for client in &clients {
        workers.push(tokio::spawn(snapshot_poller(
            client.clone(),
            config.clone(),
            state.clone(),
            health.clone(),
            stop.clone(),
        )));
        if client.name() != "okx" || config.enable_okx_liquidations {
            workers.push(tokio::spawn(liquidation_worker(
                client.clone(),
                config.clone(),
                state.clone(),
                health.clone(),
                stop.clone(),
            )));
        }
    }

    info!(
        symbol = %config.symbol,
        exchanges = ?clients.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "Layer0 started"
    );

    loop {
        let cycle_ms = now_ms();
        match detector.score_cycle(cycle_ms, &health).await {
            CycleOutcome::Emit(event) => {
                info!(
                    direction = %event.direction,
                    score = %format!("{:.3}", event.score),
                    degraded = event.degraded,
                    reason = event.degrade_reason.as_deref().unwrap_or(""),
                    "Trap setup emitted"
                );
                out.emit(event, &health);
                health.mark_emitted(cycle_ms);
            }
            CycleOutcome::Rejected => {}
            CycleOutcome::Skipped(reason) => debug!(reason, "Layer0 cycle skipped"),
        }

        if sleep_or_stop(&stop, config.cadence()).await {
            break;
        }
    }

    join_all(workers).await;
    info!("Layer0 stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::exchange::FeedStream;
    use crate::stream::channel;
    use crate::types::LiquidationUpdate;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeClient {
        name: &'static str,
        base_oi: f64,
        oi_step: f64,
        funding_rate: f64,
        mark_price: f64,
        fail_status: Option<u16>,
        emit_liquidation: bool,
        calls: AtomicUsize,
    }

    impl FakeClient {
        fn healthy(name: &'static str) -> Self {
            Self {
                name,
                base_oi: 100.0,
                oi_step: 5.0,
                funding_rate: -0.001,
                mark_price: 10_000.0,
                fail_status: None,
                emit_liquidation: true,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(name: &'static str, status: u16) -> Self {
            Self {
                fail_status: Some(status),
                emit_liquidation: false,
                ..Self::healthy(name)
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for FakeClient {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_snapshot(&self, symbol: &str) -> Result<ExchangeSnapshot> {
            if let Some(status) = self.fail_status {
                return Err(Error::HttpStatus {
                    status,
                    endpoint: "/snapshot".to_string(),
                });
            }
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ExchangeSnapshot {
                exchange: self.name.to_string(),
                symbol: symbol.to_string(),
                open_interest: Some(self.base_oi + self.oi_step * calls as f64),
                funding_rate: Some(self.funding_rate),
                mark_price: Some(self.mark_price),
                ts_ms: now_ms(),
                active: true,
                error: None,
            })
        }

        async fn stream_liquidations(&self, symbol: &str) -> Result<FeedStream<LiquidationUpdate>> {
            if !self.emit_liquidation {
                return Ok(stream::pending().boxed());
            }
            // Short liquidations half a percent above mark
            let price = self.mark_price * 1.005;
            let update = LiquidationUpdate {
                exchange: self.name.to_string(),
                symbol: symbol.to_string(),
                price,
                quantity: 10.0,
                notional: price * 10.0,
                liquidated_side: Direction::Short,
                ts_ms: now_ms(),
            };
            Ok(stream::iter(vec![Ok(update)]).chain(stream::pending()).boxed())
        }
    }

    fn test_config(warmup_minutes: f64) -> Layer0Config {
        Layer0Config {
            cadence_seconds: 0.05,
            rest_poll_interval_seconds: 0.05,
            snapshot_staleness_seconds: 2.0,
            warmup_minutes,
            backoff: BackoffConfig {
                min_seconds: 0.05,
                max_seconds: 0.2,
            },
            ..Default::default()
        }
    }

    fn old_event() -> TrapSetupEvent {
        TrapSetupEvent {
            event_id: "old".to_string(),
            ts_ms: 0,
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            score: 1.0,
            passed: true,
            components: SignalBreakdown::default(),
            raw: TrapMeta::default(),
            degraded: false,
            degrade_reason: None,
        }
    }

    async fn run_for(
        config: Layer0Config,
        clients: Vec<Arc<dyn ExchangeClient>>,
        out: EventSender<TrapSetupEvent>,
        health: Arc<HealthCounters>,
        millis: u64,
    ) {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_layer0(config, clients, out, health, stop.clone()));
        tokio::time::sleep(Duration::from_millis(millis)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("layer0 did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_drop_oldest_policy() {
        let (tx, rx) = channel(1);
        tx.send(old_event());
        let health = Arc::new(HealthCounters::new());

        run_for(
            test_config(0.0),
            vec![Arc::new(FakeClient::healthy("binance"))],
            tx,
            health.clone(),
            400,
        )
        .await;

        assert_eq!(rx.len(), 1);
        let latest = rx.try_recv().unwrap();
        assert_ne!(latest.event_id, "old");
        assert!(health.queue_drops() >= 1);
        assert!(health.emitted_events() >= 1);
    }

    #[tokio::test]
    async fn test_bybit_403_degrades_but_emits() {
        let (tx, rx) = channel(1);
        let health = Arc::new(HealthCounters::new());

        run_for(
            test_config(0.0),
            vec![
                Arc::new(FakeClient::healthy("binance")),
                Arc::new(FakeClient::failing("bybit", 403)),
            ],
            tx,
            health.clone(),
            500,
        )
        .await;

        let event = rx.try_recv().expect("no event emitted");
        assert!(event.degraded);
        let reason = event.degrade_reason.unwrap();
        assert!(reason.contains("BYBIT_403"));
        assert!(reason.contains("BYBIT_INACTIVE"));
        assert_eq!(event.raw.active_exchanges, vec!["binance".to_string()]);
        assert!(health.reconnects("bybit") >= 1);
    }

    #[tokio::test]
    async fn test_warmup_suppresses_early_emission() {
        let (tx, rx) = channel(10);
        let health = Arc::new(HealthCounters::new());

        run_for(
            test_config(1.0),
            vec![Arc::new(FakeClient::healthy("binance"))],
            tx,
            health.clone(),
            300,
        )
        .await;

        assert!(rx.is_empty());
        assert_eq!(health.emitted_events(), 0);
    }

    #[tokio::test]
    async fn test_score_cycle_reports_stale_and_missing() {
        let mut detector = TrapDetector::new(test_config(0.0), ["binance", "okx"]);
        let health = HealthCounters::new();
        let now = 10_000_000;
        {
            let state = detector.shared_state();
            let mut state = state.write().await;
            for (ts, oi) in [(now - 60_000, 100.0), (now - 3_000, 104.0)] {
                state.record_snapshot(
                    ExchangeSnapshot {
                        exchange: "binance".to_string(),
                        symbol: "BTCUSDT".to_string(),
                        open_interest: Some(oi),
                        funding_rate: Some(0.0),
                        mark_price: Some(10_000.0),
                        ts_ms: ts,
                        active: true,
                        error: None,
                    },
                    i64::MAX / 4,
                    i64::MAX / 4,
                );
            }
        }

        // Last binance snapshot is 3s old against a 2s staleness bound
        let outcome = detector.score_cycle(now, &health).await;
        assert_eq!(outcome, CycleOutcome::Skipped("no_price"));
        assert_eq!(health.stale_cycles(), 1);
    }

    #[tokio::test]
    async fn test_empty_clients_rejected() {
        let (tx, _rx) = channel(1);
        let result = run_layer0(
            test_config(0.0),
            Vec::new(),
            tx,
            Arc::new(HealthCounters::new()),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
