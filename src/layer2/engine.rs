//! Layer2 ignition engine
//!
//! Holds the latest passing absorption and a rolling candle window. Each
//! cadence tick counts structural and momentum confirmations; a passing
//! tick emits one `PrePumpEvent` and consumes the absorption.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::signals::{build_ignition_breakdown, CONFIRMATION_COUNT};
use super::structure::StructureDetector;
use crate::config::Layer2Config;
use crate::error::Result;
use crate::exchange::CandleSource;
use crate::health::HealthCounters;
use crate::stream::{sleep_or_stop, Backoff, EventReceiver, EventSender};
use crate::types::{
    join_reasons, new_event_id, now_ms, AbsorptionEvent, Candle, CycleOutcome, IgnitionMeta, PrePumpEvent,
    StructureMeta, StructureSignal,
};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Collaborators feeding Layer2
#[derive(Clone)]
pub struct Layer2Feeds {
    pub candles: Arc<dyn CandleSource>,
    pub detector: Arc<dyn StructureDetector>,
}

#[derive(Debug, Default)]
pub struct Layer2State {
    active_absorption: Option<AbsorptionEvent>,
    candles: Option<Vec<Candle>>,
    last_candle_error: Option<String>,
    last_detector_error: Option<String>,
}

impl Layer2State {
    /// Drop the active absorption only if it is still `event_id`; a newer
    /// one offered meanwhile stays armed.
    fn clear_absorption(&mut self, event_id: &str) -> bool {
        if self.active_absorption.as_ref().map(|a| a.event_id.as_str()) == Some(event_id) {
            self.active_absorption = None;
            return true;
        }
        false
    }

    pub fn active_absorption_id(&self) -> Option<&str> {
        self.active_absorption.as_ref().map(|a| a.event_id.as_str())
    }
}

pub struct IgnitionEngine {
    config: Layer2Config,
    detector: Arc<dyn StructureDetector>,
    state: Arc<RwLock<Layer2State>>,
}

impl IgnitionEngine {
    pub fn new(config: Layer2Config, detector: Arc<dyn StructureDetector>) -> Self {
        Self {
            config,
            detector,
            state: Arc::new(RwLock::new(Layer2State::default())),
        }
    }

    pub fn shared_state(&self) -> Arc<RwLock<Layer2State>> {
        self.state.clone()
    }

    pub async fn offer_absorption(&self, event: AbsorptionEvent) -> bool {
        if !event.passed || !event.symbol.eq_ignore_ascii_case(&self.config.symbol) {
            return false;
        }
        debug!(event_id = %event.event_id, direction = %event.direction, "Layer2 absorption activated");
        self.state.write().await.active_absorption = Some(event);
        true
    }

    async fn detect_structure(&self, candles: &[Candle], absorption: &AbsorptionEvent) -> StructureSignal {
        if !self.config.enable_structure_detector {
            return StructureSignal {
                meta: StructureMeta {
                    backend: "disabled".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            };
        }
        match self.detector.detect(candles, absorption.direction).await {
            Ok(signal) => {
                self.state.write().await.last_detector_error = None;
                signal
            }
            Err(e) => {
                warn!(detector = self.detector.name(), "Structure detector failed: {}", e);
                self.state.write().await.last_detector_error = Some(format!("SMC_{}", e.reason_code()));
                StructureSignal {
                    meta: StructureMeta {
                        backend: "error".to_string(),
                        note: Some(e.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
        }
    }

    pub async fn score_cycle(&self, now_ms: i64) -> CycleOutcome<PrePumpEvent> {
        let (absorption, candles) = {
            let mut state = self.state.write().await;
            let Some(absorption) = state.active_absorption.clone() else {
                return CycleOutcome::Skipped("no_absorption");
            };
            let Some(candles) = state.candles.clone() else {
                return CycleOutcome::Skipped("no_candles");
            };
            if now_ms - absorption.ts_ms > self.config.setup_ttl_ms() {
                debug!(event_id = %absorption.event_id, "Layer2 absorption expired");
                state.clear_absorption(&absorption.event_id);
                return CycleOutcome::Skipped("absorption_expired");
            }
            (absorption, candles)
        };

        let structure = self.detect_structure(&candles, &absorption).await;
        let thresholds = &self.config.thresholds;
        let (breakdown, momentum) = build_ignition_breakdown(&absorption, &candles, &structure, thresholds);

        if breakdown.confirmations < thresholds.min_confirmations {
            debug!(
                confirmations = breakdown.confirmations,
                required = thresholds.min_confirmations,
                "Layer2 gate not met"
            );
            return CycleOutcome::Rejected;
        }

        let mut state = self.state.write().await;
        let reasons: Vec<String> = state
            .last_candle_error
            .iter()
            .chain(state.last_detector_error.iter())
            .cloned()
            .collect();
        // Single-shot: the absorption cannot ignite twice
        if !state.clear_absorption(&absorption.event_id) {
            debug!(scored = %absorption.event_id, "Newer absorption arrived during detection");
        }
        drop(state);

        let trap = &absorption.raw.source_trap_raw;
        let raw = IgnitionMeta {
            min_confirmations: thresholds.min_confirmations,
            confirmations: breakdown.confirmations,
            absorption_score: absorption.score,
            momentum_return_pct: momentum.return_pct,
            source_trap_score: absorption.raw.source_trap_score,
            smc_backend: structure.meta.backend.clone(),
            entry: None,
            current_price: candles.last().map(|c| c.close),
            swept_liquidation_zone_low: trap.swept_liquidation_zone_low,
            swept_liquidation_zone_high: trap.swept_liquidation_zone_high,
            nearest_ob_above: structure.meta.nearest_ob_above,
            nearest_ob_below: structure.meta.nearest_ob_below,
            smc_meta: structure.meta,
            source_absorption_degraded: absorption.degraded,
            source_absorption_raw: absorption.raw.clone(),
            source_absorption_components: absorption.components,
        };

        CycleOutcome::Emit(PrePumpEvent {
            event_id: new_event_id(),
            ts_ms: now_ms,
            symbol: self.config.symbol.clone(),
            direction: absorption.direction,
            score: breakdown.confirmations as f64 / CONFIRMATION_COUNT as f64,
            passed: true,
            source_absorption_event_id: absorption.event_id,
            source_trap_event_id: absorption.source_trap_event_id,
            components: breakdown,
            raw,
            degraded: !reasons.is_empty(),
            degrade_reason: join_reasons(&reasons),
        })
    }
}

async fn absorption_consumer(engine: Arc<IgnitionEngine>, input: EventReceiver<AbsorptionEvent>, stop: CancellationToken) {
    while !stop.is_cancelled() {
        if let Some(event) = input.recv_timeout(RECV_TIMEOUT).await {
            engine.offer_absorption(event).await;
        }
    }
}

async fn candle_poller(
    client: Arc<dyn CandleSource>,
    config: Layer2Config,
    state: Arc<RwLock<Layer2State>>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) {
    let name = client.name().to_string();
    let mut backoff = Backoff::from_config(&config.backoff);

    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = client.fetch_candles(&config.symbol, &config.candle_interval, config.candle_limit) => result,
        };
        let delay = match result {
            Ok(candles) => {
                let mut state = state.write().await;
                state.candles = Some(candles);
                state.last_candle_error = None;
                backoff.reset();
                config.rest_poll_interval()
            }
            Err(e) => {
                warn!(feed = %name, "Candle poll failed: {}", e);
                state.write().await.last_candle_error = Some(format!("CANDLE_{}", e.reason_code()));
                health.increment_reconnect(&name);
                backoff.next_delay()
            }
        };
        if sleep_or_stop(&stop, delay).await {
            return;
        }
    }
}

/// Run Layer2 until `stop` fires
pub async fn run_layer2(
    config: Layer2Config,
    feeds: Layer2Feeds,
    input: EventReceiver<AbsorptionEvent>,
    out: EventSender<PrePumpEvent>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) -> Result<()> {
    let engine = Arc::new(IgnitionEngine::new(config.clone(), feeds.detector.clone()));

    let workers = vec![
        tokio::spawn(absorption_consumer(engine.clone(), input, stop.clone())),
        tokio::spawn(candle_poller(
            feeds.candles.clone(),
            config.clone(),
            engine.shared_state(),
            health.clone(),
            stop.clone(),
        )),
    ];

    info!(
        symbol = %config.symbol,
        candles = feeds.candles.name(),
        detector = feeds.detector.name(),
        "Layer2 started"
    );

    loop {
        let cycle_ms = now_ms();
        match engine.score_cycle(cycle_ms).await {
            CycleOutcome::Emit(event) => {
                info!(
                    direction = %event.direction,
                    confirmations = event.components.confirmations,
                    source = %event.source_absorption_event_id,
                    degraded = event.degraded,
                    "Pre-pump emitted"
                );
                out.emit(event, &health);
                health.mark_emitted(cycle_ms);
            }
            CycleOutcome::Rejected => {}
            CycleOutcome::Skipped(reason) => debug!(reason, "Layer2 cycle skipped"),
        }

        if sleep_or_stop(&stop, config.cadence()).await {
            break;
        }
    }

    join_all(workers).await;
    info!("Layer2 stopped");
    Ok(())
}
