//! Layer1 absorption engine
//!
//! Watches aggressive flow around the latest trap setup. A setup stays
//! active until its TTL lapses or a newer one replaces it; every cadence
//! tick with enough trades is scored and may emit again.

use futures::future::join_all;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics;
use crate::config::Layer1Config;
use crate::error::{Error, Result};
use crate::exchange::{BookTickerStream, StablecoinFlowSource, TradeStream};
use crate::health::HealthCounters;
use crate::stream::{sleep_or_stop, Backoff, EventReceiver, EventSender};
use crate::types::{
    join_reasons, new_event_id, now_ms, AbsorptionBreakdown, AbsorptionEvent, AbsorptionMeta, CycleOutcome,
    OrderBookTick, StablecoinFlowObservation, TradeTick, TrapSetupEvent,
};

/// Upstream receive timeout; keeps the consumer responsive to stop
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Collaborators feeding Layer1
#[derive(Clone)]
pub struct Layer1Feeds {
    pub trades: Arc<dyn TradeStream>,
    pub book: Option<Arc<dyn BookTickerStream>>,
    pub stablecoin: Option<Arc<dyn StablecoinFlowSource>>,
}

#[derive(Debug, Default)]
pub struct Layer1State {
    active_setup: Option<TrapSetupEvent>,
    trades: VecDeque<TradeTick>,
    books: VecDeque<OrderBookTick>,
    stablecoin_flow: Option<StablecoinFlowObservation>,
    last_trade_error: Option<String>,
    last_book_error: Option<String>,
    last_stablecoin_error: Option<String>,
}

impl Layer1State {
    fn prune(&mut self, now_ms: i64, window_ms: i64) {
        let cutoff = now_ms - window_ms;
        while self.trades.front().is_some_and(|t| t.ts_ms < cutoff) {
            self.trades.pop_front();
        }
        while self.books.front().is_some_and(|b| b.ts_ms < cutoff) {
            self.books.pop_front();
        }
    }
}

pub struct AbsorptionEngine {
    config: Layer1Config,
    state: Arc<RwLock<Layer1State>>,
}

impl AbsorptionEngine {
    pub fn new(config: Layer1Config) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(Layer1State::default())),
        }
    }

    pub fn shared_state(&self) -> Arc<RwLock<Layer1State>> {
        self.state.clone()
    }

    /// Adopt a trap setup if it passed and targets this symbol
    pub async fn offer_setup(&self, event: TrapSetupEvent) -> bool {
        if !event.passed || !event.symbol.eq_ignore_ascii_case(&self.config.symbol) {
            return false;
        }
        debug!(event_id = %event.event_id, direction = %event.direction, "Layer1 setup activated");
        self.state.write().await.active_setup = Some(event);
        true
    }

    pub async fn score_cycle(&self, now_ms: i64) -> CycleOutcome<AbsorptionEvent> {
        let config = &self.config;
        let thresholds = &config.thresholds;
        let mut state = self.state.write().await;
        state.prune(now_ms, config.trade_window_ms());

        let Some(setup) = state.active_setup.as_ref() else {
            return CycleOutcome::Skipped("no_setup");
        };
        if now_ms - setup.ts_ms > config.setup_ttl_ms() {
            debug!(event_id = %setup.event_id, "Layer1 setup expired");
            state.active_setup = None;
            return CycleOutcome::Skipped("setup_expired");
        }
        if state.trades.len() < config.min_trades_for_metrics {
            return CycleOutcome::Skipped("insufficient_trades");
        }

        let trades: Vec<TradeTick> = state.trades.iter().cloned().collect();
        let whale =
            metrics::compute_whale_net_flow_scores(&trades, thresholds.whale_notional_usd, thresholds.whale_flow_scale_usd);
        let twap = metrics::compute_twap_uniformity_scores(
            &trades,
            thresholds.whale_notional_usd,
            thresholds.twap_interval_cv_limit,
        );
        let cvd = metrics::compute_cvd_scores(&trades, thresholds.cvd_scale_usd);

        let mut reasons: Vec<String> = Vec::new();
        reasons.extend(state.last_trade_error.clone());

        let mut stablecoin_usd = None;
        let mut stablecoin_score = 0.0;
        if config.whale_alert.enabled {
            match &state.stablecoin_flow {
                Some(observation) => {
                    stablecoin_usd = Some(observation.inflow_usd);
                    stablecoin_score = metrics::compute_stablecoin_inflow_score(
                        observation.inflow_usd,
                        thresholds.stablecoin_inflow_scale_usd,
                    );
                }
                None => reasons.push("WHALE_ALERT_NO_DATA".to_string()),
            }
            reasons.extend(state.last_stablecoin_error.clone());
        }

        let book = if config.enable_binance_orderbook {
            reasons.extend(state.last_book_error.clone());
            let books: Vec<OrderBookTick> = state.books.iter().cloned().collect();
            metrics::compute_orderbook_imbalance(&books)
        } else {
            metrics::OrderbookImbalance::default()
        };

        let breakdown = AbsorptionBreakdown {
            whale_net_flow_long: whale.long,
            whale_net_flow_short: whale.short,
            twap_uniformity_long: twap.long,
            twap_uniformity_short: twap.short,
            cvd_long: cvd.long,
            cvd_short: cvd.short,
            stablecoin_inflow: stablecoin_score,
            hidden_divergence_long: cvd.hidden_long,
            hidden_divergence_short: cvd.hidden_short,
            orderbook_imbalance_long: book.long,
            orderbook_imbalance_short: book.short,
        };

        let direction = setup.direction;
        let score = metrics::compute_absorption_score(&breakdown, direction, &config.weights);
        if !metrics::passes_absorption_gate(&breakdown, direction, score, thresholds) {
            debug!(direction = %direction, score, "Layer1 gate not met");
            return CycleOutcome::Rejected;
        }

        let raw = AbsorptionMeta {
            trade_count: trades.len(),
            whale_trade_count: twap.whale_count,
            whale_net_flow_usd: whale.net_flow_usd,
            twap_interval_cv: twap.interval_cv,
            cvd_delta_usd: cvd.delta_usd,
            price_delta_pct: cvd.price_delta_pct,
            stablecoin_inflow_usd: stablecoin_usd,
            orderbook_imbalance_avg: book.average,
            orderbook_tick_count: book.tick_count,
            current_price: trades.iter().max_by_key(|t| t.ts_ms).map(|t| t.price),
            source_trap_score: setup.score,
            source_trap_degraded: setup.degraded,
            source_trap_raw: setup.raw.clone(),
        };

        CycleOutcome::Emit(AbsorptionEvent {
            event_id: new_event_id(),
            ts_ms: now_ms,
            symbol: config.symbol.clone(),
            direction,
            score,
            passed: true,
            source_trap_event_id: setup.event_id.clone(),
            components: breakdown,
            raw,
            degraded: !reasons.is_empty(),
            degrade_reason: join_reasons(&reasons),
        })
    }
}

async fn setup_consumer(
    engine: Arc<AbsorptionEngine>,
    input: EventReceiver<TrapSetupEvent>,
    stop: CancellationToken,
) {
    while !stop.is_cancelled() {
        if let Some(event) = input.recv_timeout(RECV_TIMEOUT).await {
            engine.offer_setup(event).await;
        }
    }
}

async fn trade_collector(
    client: Arc<dyn TradeStream>,
    config: Layer1Config,
    state: Arc<RwLock<Layer1State>>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) {
    let name = client.name().to_string();
    let mut backoff = Backoff::from_config(&config.backoff);
    let window_ms = config.trade_window_ms();

    loop {
        let consume = async {
            let mut trades = client.stream_trades(&config.symbol).await?;
            backoff.reset();
            while let Some(trade) = trades.next().await {
                let trade = trade?;
                let mut state = state.write().await;
                state.last_trade_error = None;
                let ts_ms = trade.ts_ms;
                state.trades.push_back(trade);
                state.prune(ts_ms, window_ms);
            }
            Err::<(), Error>(Error::StreamEnded(format!("{} trade", name)))
        };
        let error = tokio::select! {
            _ = stop.cancelled() => return,
            Err(e) = consume => e,
        };

        warn!(feed = %name, "Trade stream dropped: {}", error);
        state.write().await.last_trade_error = Some(format!("TRADE_STREAM_{}", error.reason_code()));
        health.increment_reconnect(&name);
        if sleep_or_stop(&stop, backoff.next_delay()).await {
            return;
        }
    }
}

async fn book_collector(
    client: Arc<dyn BookTickerStream>,
    config: Layer1Config,
    state: Arc<RwLock<Layer1State>>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) {
    let name = client.name().to_string();
    let mut backoff = Backoff::from_config(&config.backoff);

    loop {
        let consume = async {
            let mut books = client.stream_book_ticker(&config.symbol).await?;
            backoff.reset();
            while let Some(book) = books.next().await {
                let book = book?;
                let mut state = state.write().await;
                state.last_book_error = None;
                state.books.push_back(book);
            }
            Err::<(), Error>(Error::StreamEnded(format!("{} book ticker", name)))
        };
        let error = tokio::select! {
            _ = stop.cancelled() => return,
            Err(e) = consume => e,
        };

        warn!(feed = %name, "Book ticker stream dropped: {}", error);
        state.write().await.last_book_error = Some(format!("ORDERBOOK_STREAM_{}", error.reason_code()));
        health.increment_reconnect(&name);
        if sleep_or_stop(&stop, backoff.next_delay()).await {
            return;
        }
    }
}

async fn stablecoin_poller(
    client: Arc<dyn StablecoinFlowSource>,
    config: Layer1Config,
    state: Arc<RwLock<Layer1State>>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) {
    let name = client.name().to_string();
    let mut backoff = Backoff::from_config(&config.backoff);

    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = client.fetch_inflow_usd() => result,
        };
        let delay = match result {
            Ok(observation) => {
                let mut state = state.write().await;
                state.stablecoin_flow = Some(observation);
                state.last_stablecoin_error = None;
                backoff.reset();
                config.whale_alert.poll_interval()
            }
            Err(e) => {
                warn!(feed = %name, "Stablecoin flow poll failed: {}", e);
                state.write().await.last_stablecoin_error = Some(format!("STABLECOIN_{}", e.reason_code()));
                health.increment_reconnect(&name);
                backoff.next_delay()
            }
        };
        if sleep_or_stop(&stop, delay).await {
            return;
        }
    }
}

/// Run Layer1 until `stop` fires
pub async fn run_layer1(
    config: Layer1Config,
    feeds: Layer1Feeds,
    input: EventReceiver<TrapSetupEvent>,
    out: EventSender<AbsorptionEvent>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) -> Result<()> {
    let engine = Arc::new(AbsorptionEngine::new(config.clone()));
    let state = engine.shared_state();

    let mut workers = vec![
        tokio::spawn(setup_consumer(engine.clone(), input, stop.clone())),
        tokio::spawn(trade_collector(
            feeds.trades.clone(),
            config.clone(),
            state.clone(),
            health.clone(),
            stop.clone(),
        )),
    ];
    if config.enable_binance_orderbook {
        match feeds.book.clone() {
            Some(book) => workers.push(tokio::spawn(book_collector(
                book,
                config.clone(),
                state.clone(),
                health.clone(),
                stop.clone(),
            ))),
            None => warn!("Order book metrics enabled without a book ticker feed"),
        }
    }
    if let Some(source) = feeds.stablecoin.clone() {
        workers.push(tokio::spawn(stablecoin_poller(
            source,
            config.clone(),
            state.clone(),
            health.clone(),
            stop.clone(),
        )));
    }

    info!(symbol = %config.symbol, trades = feeds.trades.name(), "Layer1 started");

    loop {
        let cycle_ms = now_ms();
        match engine.score_cycle(cycle_ms).await {
            CycleOutcome::Emit(event) => {
                info!(
                    direction = %event.direction,
                    score = %format!("{:.3}", event.score),
                    source = %event.source_trap_event_id,
                    degraded = event.degraded,
                    "Absorption emitted"
                );
                out.emit(event, &health);
                health.mark_emitted(cycle_ms);
            }
            CycleOutcome::Rejected => {}
            CycleOutcome::Skipped(reason) => debug!(reason, "Layer1 cycle skipped"),
        }

        if sleep_or_stop(&stop, config.cadence()).await {
            break;
        }
    }

    join_all(workers).await;
    info!("Layer1 stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, WhaleAlertConfig};
    use crate::exchange::FeedStream;
    use crate::stream::channel;
    use crate::types::{Direction, SignalBreakdown, TrapMeta};
    use async_trait::async_trait;
    use futures::stream;

    struct FakeTrades(Vec<TradeTick>);

    #[async_trait]
    impl TradeStream for FakeTrades {
        fn name(&self) -> &str {
            "fake_trades"
        }

        async fn stream_trades(&self, _symbol: &str) -> Result<FeedStream<TradeTick>> {
            let trades = self.0.clone().into_iter().map(Ok);
            Ok(stream::iter(trades).chain(stream::pending()).boxed())
        }
    }

    struct FakeBooks(Vec<OrderBookTick>);

    #[async_trait]
    impl BookTickerStream for FakeBooks {
        fn name(&self) -> &str {
            "fake_book"
        }

        async fn stream_book_ticker(&self, _symbol: &str) -> Result<FeedStream<OrderBookTick>> {
            let books = self.0.clone().into_iter().map(Ok);
            Ok(stream::iter(books).chain(stream::pending()).boxed())
        }
    }

    fn trap_event(direction: Direction) -> TrapSetupEvent {
        TrapSetupEvent {
            event_id: format!("trap-{}", direction.as_str().to_lowercase()),
            ts_ms: now_ms(),
            symbol: "BTCUSDT".to_string(),
            direction,
            score: 0.8,
            passed: true,
            components: SignalBreakdown {
                liquidation_long: 1.0,
                liquidation_short: 0.2,
                funding_oi_long: 1.0,
                funding_oi_short: 0.2,
                oi_divergence: 0.8,
            },
            raw: TrapMeta {
                current_price: 10_000.0,
                ..Default::default()
            },
            degraded: false,
            degrade_reason: None,
        }
    }

    /// Buy-aggressive whale prints with rising price, one second apart
    fn trade_samples() -> Vec<TradeTick> {
        let base = now_ms();
        (0..12)
            .map(|i| TradeTick {
                exchange: "binance".to_string(),
                symbol: "BTCUSDT".to_string(),
                price: 10_000.0 + i as f64,
                quantity: 20.0,
                is_buyer_maker: false,
                ts_ms: base + i * 1_000,
            })
            .collect()
    }

    fn book_samples() -> Vec<OrderBookTick> {
        let base = now_ms();
        (0..10)
            .map(|i| OrderBookTick {
                exchange: "binance".to_string(),
                symbol: "BTCUSDT".to_string(),
                bid_price: 10_000.0 + i as f64,
                bid_qty: 120.0,
                ask_price: 10_001.0 + i as f64,
                ask_qty: 70.0,
                ts_ms: base + i * 1_000,
            })
            .collect()
    }

    fn test_config(whale_alert_enabled: bool) -> Layer1Config {
        let mut config = Layer1Config {
            cadence_seconds: 0.05,
            trade_window_seconds: 300.0,
            min_trades_for_metrics: 5,
            whale_alert: WhaleAlertConfig {
                enabled: whale_alert_enabled,
                poll_interval_seconds: 0.05,
                ..Default::default()
            },
            backoff: BackoffConfig {
                min_seconds: 0.05,
                max_seconds: 0.2,
            },
            ..Default::default()
        };
        config.thresholds.score_threshold = 0.45;
        config
    }

    fn feeds(book: Option<Arc<dyn BookTickerStream>>) -> Layer1Feeds {
        Layer1Feeds {
            trades: Arc::new(FakeTrades(trade_samples())),
            book,
            stablecoin: None,
        }
    }

    async fn run_for(
        config: Layer1Config,
        feeds: Layer1Feeds,
        setup: TrapSetupEvent,
        out: EventSender<AbsorptionEvent>,
    ) -> Arc<HealthCounters> {
        let (setup_tx, setup_rx) = channel(10);
        setup_tx.send(setup);
        let health = Arc::new(HealthCounters::new());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_layer1(config, feeds, setup_rx, out, health.clone(), stop.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("layer1 did not stop")
            .unwrap()
            .unwrap();
        health
    }

    #[tokio::test]
    async fn test_emits_absorption_for_active_long_setup() {
        let (tx, rx) = channel(10);
        let health = run_for(test_config(false), feeds(None), trap_event(Direction::Long), tx).await;

        let event = rx.try_recv().expect("no absorption emitted");
        assert_eq!(event.direction, Direction::Long);
        assert_eq!(event.source_trap_event_id, "trap-long");
        assert!(event.passed);
        assert!(!event.degraded);
        assert_eq!(event.raw.source_trap_raw.current_price, 10_000.0);
        assert!(event.raw.current_price.is_some());
        assert!(health.emitted_events() >= 1);
    }

    #[tokio::test]
    async fn test_queue_drop_oldest_policy() {
        let (tx, rx) = channel(1);
        let seed = AbsorptionEvent {
            event_id: "old".to_string(),
            ts_ms: 0,
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            score: 1.0,
            passed: true,
            source_trap_event_id: "seed".to_string(),
            components: AbsorptionBreakdown::default(),
            raw: AbsorptionMeta::default(),
            degraded: false,
            degrade_reason: None,
        };
        tx.send(seed);

        run_for(test_config(false), feeds(None), trap_event(Direction::Long), tx).await;

        assert_eq!(rx.len(), 1);
        assert_ne!(rx.try_recv().unwrap().event_id, "old");
    }

    #[tokio::test]
    async fn test_whale_alert_missing_data_sets_degraded_flag() {
        let (tx, rx) = channel(10);
        run_for(test_config(true), feeds(None), trap_event(Direction::Long), tx).await;

        let event = rx.try_recv().expect("no absorption emitted");
        assert!(event.degraded);
        assert!(event.degrade_reason.unwrap().contains("WHALE_ALERT_NO_DATA"));
        assert_eq!(event.raw.stablecoin_inflow_usd, None);
    }

    #[tokio::test]
    async fn test_includes_orderbook_microstructure() {
        let mut config = test_config(false);
        config.enable_binance_orderbook = true;
        let (tx, rx) = channel(10);
        run_for(
            config,
            feeds(Some(Arc::new(FakeBooks(book_samples())))),
            trap_event(Direction::Long),
            tx,
        )
        .await;

        let event = rx.try_recv().expect("no absorption emitted");
        assert!(event.raw.orderbook_imbalance_avg.is_some());
        assert!(event.components.orderbook_imbalance_long > 0.0);
        assert_eq!(event.components.orderbook_imbalance_short, 0.0);
    }

    #[tokio::test]
    async fn test_setup_filter_and_expiry() {
        let mut config = test_config(false);
        config.setup_ttl_seconds = 1.0;
        let engine = AbsorptionEngine::new(config);

        let mut other = trap_event(Direction::Long);
        other.symbol = "ETHUSDT".to_string();
        assert!(!engine.offer_setup(other).await);

        let mut failed = trap_event(Direction::Long);
        failed.passed = false;
        assert!(!engine.offer_setup(failed).await);
        assert_eq!(engine.score_cycle(now_ms()).await, CycleOutcome::Skipped("no_setup"));

        let setup = trap_event(Direction::Short);
        let ts = setup.ts_ms;
        assert!(engine.offer_setup(setup).await);
        assert_eq!(engine.score_cycle(ts).await, CycleOutcome::Skipped("insufficient_trades"));
        assert_eq!(engine.score_cycle(ts + 2_000).await, CycleOutcome::Skipped("setup_expired"));
        assert_eq!(engine.score_cycle(ts + 2_000).await, CycleOutcome::Skipped("no_setup"));
    }
}
