//! Pipeline wiring and supervision
//!
//! Layer0 → Layer1 → Layer2 → Layer3 → execution sink, each hop a bounded
//! drop-oldest channel. All tasks share one cancellation token; shutdown
//! joins every task before collaborators are closed.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::exchange::http::build_client;
use crate::exchange::{
    BinanceClient, BinanceFuturesClient, BybitClient, ExchangeClient, OkxClient, OrderClient, StablecoinFlowSource,
    WhaleAlertClient,
};
use crate::health::HealthCounters;
use crate::layer0::run_layer0;
use crate::layer1::{run_layer1, Layer1Feeds};
use crate::layer2::{run_layer2, HeuristicDetector, Layer2Feeds};
use crate::layer3::{run_layer3, Layer3Clients};
use crate::notify::{format_health_report, HealthReport, Notifier, TelegramNotifier};
use crate::stream::{channel, sleep_or_stop, EventReceiver, EventSender};
use crate::types::{AbsorptionEvent, ExecutionEvent, PipelineEvent, PrePumpEvent, TrapSetupEvent};

const SINK_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Every external dependency the layers talk to
#[derive(Clone)]
pub struct Collaborators {
    pub exchanges: Vec<Arc<dyn ExchangeClient>>,
    pub layer1: Layer1Feeds,
    pub layer2: Layer2Feeds,
    pub layer3: Layer3Clients,
}

impl Collaborators {
    /// Build the production adapters selected by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = build_client(config.endpoints.http_timeout())?;
        let endpoints = &config.endpoints;
        let l0 = &config.layer0;

        let binance = Arc::new(BinanceClient::new(http.clone(), endpoints));
        let mut exchanges: Vec<Arc<dyn ExchangeClient>> = Vec::new();
        if l0.enable_binance {
            exchanges.push(binance.clone());
        }
        if l0.enable_bybit {
            exchanges.push(Arc::new(BybitClient::new(http.clone(), endpoints)));
        }
        if l0.enable_okx {
            exchanges.push(Arc::new(OkxClient::new(http.clone(), endpoints)));
        }

        let whale_alert = &config.layer1.whale_alert;
        let stablecoin: Option<Arc<dyn StablecoinFlowSource>> = whale_alert
            .enabled
            .then(|| Arc::new(WhaleAlertClient::new(http.clone(), endpoints, whale_alert)) as _);

        let l3 = &config.layer3;
        let orders: Option<Arc<dyn OrderClient>> = if l3.is_live() {
            Some(Arc::new(BinanceFuturesClient::new(http.clone(), endpoints, &l3.binance)?))
        } else {
            None
        };
        let notifier: Option<Arc<dyn Notifier>> = if l3.telegram.enabled {
            Some(Arc::new(TelegramNotifier::new(http, endpoints, &l3.telegram)?))
        } else {
            None
        };

        Ok(Self {
            exchanges,
            layer1: Layer1Feeds {
                trades: binance.clone(),
                book: config.layer1.enable_binance_orderbook.then(|| binance.clone() as _),
                stablecoin,
            },
            layer2: Layer2Feeds {
                candles: binance,
                detector: Arc::new(HeuristicDetector),
            },
            layer3: Layer3Clients { orders, notifier },
        })
    }

    /// Release connections; failures are logged and ignored
    pub async fn close(&self) {
        for exchange in &self.exchanges {
            if let Err(e) = exchange.close().await {
                debug!(exchange = exchange.name(), "Close failed: {}", e);
            }
        }
        if let Some(orders) = &self.layer3.orders {
            if let Err(e) = orders.close().await {
                debug!(client = orders.name(), "Close failed: {}", e);
            }
        }
        if let Some(notifier) = &self.layer3.notifier {
            if let Err(e) = notifier.close().await {
                debug!(notifier = notifier.name(), "Close failed: {}", e);
            }
        }
    }
}

/// Per-layer counters, index = layer number
#[derive(Debug, Clone, Default)]
pub struct PipelineHealth {
    pub layers: [Arc<HealthCounters>; 4],
}

/// Run a layer; a layer that fails stops the whole pipeline
fn supervise<F>(layer: &'static str, fut: F, stop: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(layer, "Layer failed: {}", e);
            stop.cancel();
        }
    })
}

async fn execution_sink(input: EventReceiver<ExecutionEvent>, stop: CancellationToken) {
    while !stop.is_cancelled() {
        if let Some(event) = input.recv_timeout(SINK_RECV_TIMEOUT).await {
            info!(event = %event.to_flat_map(), "Execution event");
        }
    }
}

struct QueueGauges {
    trap: EventSender<TrapSetupEvent>,
    absorption: EventSender<AbsorptionEvent>,
    pre_pump: EventSender<PrePumpEvent>,
    execution: EventSender<ExecutionEvent>,
}

impl QueueGauges {
    fn sizes(&self) -> [usize; 4] {
        [
            self.trap.len(),
            self.absorption.len(),
            self.pre_pump.len(),
            self.execution.len(),
        ]
    }
}

async fn health_logger(
    config: Config,
    interval: Duration,
    queues: QueueGauges,
    health: PipelineHealth,
    stop: CancellationToken,
) {
    loop {
        if sleep_or_stop(&stop, interval).await {
            return;
        }
        let report = HealthReport {
            symbol: config.layer0.symbol.clone(),
            mode: config.layer3.execution_mode.to_string(),
            queue_sizes: queues.sizes(),
            layers: [
                health.layers[0].snapshot(),
                health.layers[1].snapshot(),
                health.layers[2].snapshot(),
                health.layers[3].snapshot(),
            ],
            ..Default::default()
        };
        info!("\n{}", format_health_report(&report));
    }
}

/// Run every layer until `stop` fires, then join and close collaborators
pub async fn run(
    config: Config,
    collaborators: Collaborators,
    health: PipelineHealth,
    stop: CancellationToken,
) -> Result<()> {
    let capacity = config.pipeline.queue_capacity;
    let (trap_tx, trap_rx) = channel::<TrapSetupEvent>(capacity);
    let (absorption_tx, absorption_rx) = channel::<AbsorptionEvent>(capacity);
    let (pre_pump_tx, pre_pump_rx) = channel::<PrePumpEvent>(capacity);
    let (execution_tx, execution_rx) = channel::<ExecutionEvent>(capacity);

    let queues = QueueGauges {
        trap: trap_tx.clone(),
        absorption: absorption_tx.clone(),
        pre_pump: pre_pump_tx.clone(),
        execution: execution_tx.clone(),
    };

    info!(
        symbol = %config.layer0.symbol,
        mode = %config.layer3.execution_mode,
        exchanges = collaborators.exchanges.len(),
        queue_capacity = capacity,
        "Pipeline starting"
    );

    let mut tasks = vec![
        supervise(
            "layer0",
            run_layer0(
                config.layer0.clone(),
                collaborators.exchanges.clone(),
                trap_tx,
                health.layers[0].clone(),
                stop.clone(),
            ),
            stop.clone(),
        ),
        supervise(
            "layer1",
            run_layer1(
                config.layer1.clone(),
                collaborators.layer1.clone(),
                trap_rx,
                absorption_tx,
                health.layers[1].clone(),
                stop.clone(),
            ),
            stop.clone(),
        ),
        supervise(
            "layer2",
            run_layer2(
                config.layer2.clone(),
                collaborators.layer2.clone(),
                absorption_rx,
                pre_pump_tx,
                health.layers[2].clone(),
                stop.clone(),
            ),
            stop.clone(),
        ),
        supervise(
            "layer3",
            run_layer3(
                config.layer3.clone(),
                collaborators.layer3.clone(),
                pre_pump_rx,
                execution_tx,
                health.layers[3].clone(),
                stop.clone(),
            ),
            stop.clone(),
        ),
        tokio::spawn(execution_sink(execution_rx, stop.clone())),
    ];

    match config.pipeline.health_log_interval() {
        Some(interval) => tasks.push(tokio::spawn(health_logger(
            config.clone(),
            interval,
            queues,
            health.clone(),
            stop.clone(),
        ))),
        None => debug!("Periodic health log disabled"),
    }

    stop.cancelled().await;
    info!("Pipeline stopping");

    for result in join_all(tasks).await {
        if let Err(e) = result {
            warn!("Pipeline task panicked: {}", e);
        }
    }
    collaborators.close().await;
    info!("Pipeline stopped");
    Ok(())
}

/// Cancel `stop` on Ctrl-C
pub fn cancel_on_ctrl_c(stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Ctrl-C received"),
                    Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                }
                stop.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::exchange::{CandleSource, FeedStream, TradeStream};
    use crate::types::{Candle, ExchangeSnapshot, LiquidationUpdate, TradeTick};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One venue standing in for every market-data collaborator
    #[derive(Default)]
    struct FakeVenue {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeClient for FakeVenue {
        fn name(&self) -> &str {
            "binance"
        }

        async fn fetch_snapshot(&self, symbol: &str) -> Result<ExchangeSnapshot> {
            Ok(ExchangeSnapshot {
                exchange: "binance".to_string(),
                symbol: symbol.to_string(),
                open_interest: Some(1_000.0),
                funding_rate: Some(0.0001),
                mark_price: Some(62_959.0),
                ts_ms: crate::types::now_ms(),
                active: true,
                error: None,
            })
        }

        async fn stream_liquidations(&self, _symbol: &str) -> Result<FeedStream<LiquidationUpdate>> {
            Ok(futures::stream::pending().boxed())
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl TradeStream for FakeVenue {
        fn name(&self) -> &str {
            "binance"
        }

        async fn stream_trades(&self, _symbol: &str) -> Result<FeedStream<TradeTick>> {
            Ok(futures::stream::pending().boxed())
        }
    }

    #[async_trait]
    impl CandleSource for FakeVenue {
        fn name(&self) -> &str {
            "binance"
        }

        async fn fetch_candles(&self, _symbol: &str, _interval: &str, _limit: usize) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }
    }

    fn fake_collaborators(venue: Arc<FakeVenue>) -> Collaborators {
        Collaborators {
            exchanges: vec![venue.clone() as Arc<dyn ExchangeClient>],
            layer1: Layer1Feeds {
                trades: venue.clone(),
                book: None,
                stablecoin: None,
            },
            layer2: Layer2Feeds {
                candles: venue,
                detector: Arc::new(HeuristicDetector),
            },
            layer3: Layer3Clients::default(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_stops_and_closes_collaborators() {
        let mut config = Config::default();
        config.layer0.rest_poll_interval_seconds = 0.05;
        config.layer0.cadence_seconds = 0.05;
        config.pipeline.health_log_interval_seconds = 0.05;

        let venue = Arc::new(FakeVenue::default());
        let health = PipelineHealth::default();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(config, fake_collaborators(venue.clone()), health.clone(), stop.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("pipeline did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(venue.closed.load(Ordering::SeqCst), 1);
        // Warmup keeps Layer0 quiet
        assert_eq!(health.layers[0].emitted_events(), 0);
    }

    #[tokio::test]
    async fn test_failing_layer_cancels_pipeline() {
        let mut config = Config::default();
        config.layer3.execution_mode = ExecutionMode::Live;

        let venue = Arc::new(FakeVenue::default());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(
            config,
            fake_collaborators(venue.clone()),
            PipelineHealth::default(),
            stop.clone(),
        ));

        // Live mode without an order client fails Layer3 at startup
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("pipeline did not stop")
            .unwrap()
            .unwrap();
        assert!(stop.is_cancelled());
        assert_eq!(venue.closed.load(Ordering::SeqCst), 1);
    }
}
