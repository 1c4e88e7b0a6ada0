//! Layer3 executor
//!
//! Turns pre-pump events into execution plans. In live mode the entry is
//! a market order followed by three reduce-only exits; in paper mode the
//! order ids are placeholders. Every processed event is announced on the
//! notification channel and forwarded as an `ExecutionEvent`.

use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::planner::{build_execution_plan, derive_entry_price, round_to};
use super::sizing::{size_multiplier, sized_quantity};
use crate::config::Layer3Config;
use crate::error::{Error, Result};
use crate::exchange::{OrderClient, OrderRequest, OrderSide, OrderType};
use crate::health::HealthCounters;
use crate::notify::{format_execution_error, format_signal, Notifier};
use crate::stream::{sleep_or_stop, EventReceiver, EventSender};
use crate::types::{
    join_reasons, new_event_id, now_ms, ExecutionEvent, ExecutionMeta, ExecutionPlan, OrderIds, PrePumpEvent,
};

const HOUR_MS: i64 = 3_600_000;
const MIN_RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Reconnect counter charged for execution failures
pub const EXECUTOR_FEED: &str = "layer3_executor";

/// Collaborators used by Layer3
#[derive(Clone, Default)]
pub struct Layer3Clients {
    pub orders: Option<Arc<dyn OrderClient>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

/// Why an incoming event was not executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotPassed,
    SymbolMismatch,
    Expired,
    Duplicate,
    Cooldown { remaining_ms: i64 },
    HourlyLimit { limit: usize },
}

/// Orders placed for one live entry
struct LiveFill {
    order_ids: OrderIds,
    entry_price: f64,
    responses: serde_json::Value,
}

pub struct Executor {
    config: Layer3Config,
    clients: Layer3Clients,
    last_entry_ts_ms: Option<i64>,
    recent_entries: VecDeque<i64>,
    seen_ids: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl Executor {
    pub fn new(config: Layer3Config, clients: Layer3Clients) -> Self {
        Self {
            config,
            clients,
            last_entry_ts_ms: None,
            recent_entries: VecDeque::new(),
            seen_ids: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    fn notifications_enabled(&self) -> Option<&Arc<dyn Notifier>> {
        self.clients.notifier.as_ref().filter(|_| self.config.telegram.enabled)
    }

    /// Admission checks in order: pass flag, symbol, TTL, dedup, cooldown, hourly cap
    pub fn admit(&mut self, event: &PrePumpEvent, now_ms: i64) -> std::result::Result<(), SkipReason> {
        let guard = &self.config.guard;
        if !event.passed {
            return Err(SkipReason::NotPassed);
        }
        if !event.symbol.eq_ignore_ascii_case(&self.config.symbol) {
            return Err(SkipReason::SymbolMismatch);
        }
        if now_ms - event.ts_ms > self.config.pre_pump_ttl_ms() {
            return Err(SkipReason::Expired);
        }
        if self.seen_ids.contains(&event.event_id) {
            return Err(SkipReason::Duplicate);
        }

        if let Some(last) = self.last_entry_ts_ms {
            let min_gap_ms = (guard.min_seconds_between_entries * 1000.0) as i64;
            if min_gap_ms > 0 && now_ms - last < min_gap_ms {
                return Err(SkipReason::Cooldown {
                    remaining_ms: min_gap_ms - (now_ms - last),
                });
            }
        }

        let cutoff = now_ms - HOUR_MS;
        while self.recent_entries.front().is_some_and(|ts| *ts < cutoff) {
            self.recent_entries.pop_front();
        }
        if guard.max_entries_per_hour > 0 && self.recent_entries.len() >= guard.max_entries_per_hour {
            return Err(SkipReason::HourlyLimit {
                limit: guard.max_entries_per_hour,
            });
        }
        Ok(())
    }

    /// Charge cooldown, hourly cap and dedup for one entry; repeat calls
    /// for the same event are ignored
    fn record_entry(&mut self, source_event_id: &str, ts_ms: i64) {
        if self.seen_ids.contains(source_event_id) {
            return;
        }
        self.last_entry_ts_ms = Some(ts_ms);
        self.recent_entries.push_back(ts_ms);

        let capacity = self.config.dedup_capacity.max(1);
        while self.seen_order.len() >= capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_ids.remove(&old);
            }
        }
        self.seen_ids.insert(source_event_id.to_string());
        self.seen_order.push_back(source_event_id.to_string());
    }

    async fn place_live_orders(
        &mut self,
        client: &Arc<dyn OrderClient>,
        event: &PrePumpEvent,
        quantity: f64,
    ) -> Result<(LiveFill, ExecutionPlan)> {
        let symbol = &self.config.symbol;
        let (entry_side, exit_side) = OrderSide::for_direction(event.direction);

        let entry = client
            .create_order(&OrderRequest::market(symbol, entry_side, quantity))
            .await?;
        // The position is open from here on, even if an exit order fails
        self.record_entry(&event.event_id, now_ms());
        let symbol = &self.config.symbol;
        let entry_price = match entry.fill_price() {
            Some(price) => price,
            None => derive_entry_price(event)
                .ok_or_else(|| Error::EntryPriceUnavailable("no fill price and no event price".to_string()))?,
        };

        let plan = build_execution_plan(event, entry_price, quantity, &self.config.risk);

        let full_qty = round_to(quantity, 6);
        let mut tp1_qty = round_to(quantity * self.config.risk.tp1_quantity_ratio, 6);
        let mut tp2_qty = round_to((quantity - tp1_qty).max(0.0), 6);
        if tp1_qty <= 0.0 {
            tp1_qty = full_qty;
        }
        if tp2_qty <= 0.0 {
            tp2_qty = full_qty;
        }

        let sl = client
            .create_order(&OrderRequest::exit(symbol, exit_side, OrderType::StopMarket, plan.sl, full_qty))
            .await?;
        let tp1 = client
            .create_order(&OrderRequest::exit(symbol, exit_side, OrderType::TakeProfitMarket, plan.tp1, tp1_qty))
            .await?;
        let tp2 = client
            .create_order(&OrderRequest::exit(symbol, exit_side, OrderType::TakeProfitMarket, plan.tp2, tp2_qty))
            .await?;

        let fill = LiveFill {
            order_ids: OrderIds {
                entry: entry.order_id_or_na(),
                sl: sl.order_id_or_na(),
                tp1: tp1.order_id_or_na(),
                tp2: tp2.order_id_or_na(),
            },
            entry_price,
            responses: json!({
                "entry": entry.raw,
                "sl": sl.raw,
                "tp1": tp1.raw,
                "tp2": tp2.raw,
            }),
        };
        Ok((fill, plan))
    }

    /// Plan, place orders when live, notify; a live fill records the entry
    pub async fn execute(&mut self, event: &PrePumpEvent) -> Result<ExecutionEvent> {
        let multiplier = size_multiplier(event, &self.config.sizing);
        let quantity = sized_quantity(self.config.fixed_quantity, multiplier);

        let (plan, order_ids, execution_raw) = if self.config.is_live() {
            let client = self.clients.orders.clone().ok_or(Error::ExecutionClientMissing)?;
            let (fill, plan) = self.place_live_orders(&client, event, quantity).await?;
            debug!(entry = fill.entry_price, "Live entry filled");
            (plan, fill.order_ids, fill.responses)
        } else {
            let entry = derive_entry_price(event)
                .ok_or_else(|| Error::EntryPriceUnavailable("paper execution".to_string()))?;
            let plan = build_execution_plan(event, entry, quantity, &self.config.risk);
            (plan, OrderIds::paper(), json!({ "mode": "paper" }))
        };

        let mut reasons = Vec::new();
        if let Some(notifier) = self.notifications_enabled() {
            let message = format_signal(event, &plan, Some(&order_ids));
            if let Err(e) = notifier.send_message(&message).await {
                warn!(notifier = notifier.name(), "Signal notification failed: {}", e);
                reasons.push(format!("TELEGRAM_{}", e.reason_code()));
            }
        }

        Ok(ExecutionEvent {
            event_id: new_event_id(),
            ts_ms: now_ms(),
            symbol: self.config.symbol.clone(),
            direction: event.direction,
            passed: true,
            source_pre_pump_event_id: event.event_id.clone(),
            plan,
            order_ids,
            raw: ExecutionMeta {
                execution_mode: self.config.execution_mode.to_string(),
                source_pre_pump_score: event.score,
                source_pre_pump_confirmations: event.components.confirmations,
                size_multiplier: multiplier,
                execution_raw,
            },
            degraded: !reasons.is_empty(),
            degrade_reason: join_reasons(&reasons),
        })
    }

    /// Admit, execute and forward one event. Failures are reported, never raised.
    pub async fn handle(&mut self, event: PrePumpEvent, out: &EventSender<ExecutionEvent>, health: &HealthCounters) {
        match self.admit(&event, now_ms()) {
            Ok(()) => {}
            Err(SkipReason::Cooldown { remaining_ms }) => {
                warn!(layer = "L3-GUARD", symbol = %event.symbol, skip = "COOLDOWN", remaining_ms, "Entry skipped");
                return;
            }
            Err(SkipReason::HourlyLimit { limit }) => {
                warn!(layer = "L3-GUARD", symbol = %event.symbol, skip = "RATE_LIMIT_PER_HOUR", limit, "Entry skipped");
                return;
            }
            Err(reason) => {
                debug!(event_id = %event.event_id, ?reason, "Pre-pump ignored");
                return;
            }
        }

        match self.execute(&event).await {
            Ok(execution) => {
                info!(
                    direction = %execution.direction,
                    mode = %execution.raw.execution_mode,
                    entry = execution.plan.entry,
                    sl = execution.plan.sl,
                    tp1 = execution.plan.tp1,
                    tp2 = execution.plan.tp2,
                    degraded = execution.degraded,
                    "Execution emitted"
                );
                let ts_ms = execution.ts_ms;
                out.emit(execution, health);
                health.mark_emitted(ts_ms);
                self.record_entry(&event.event_id, ts_ms);
            }
            Err(e) => {
                error!(event_id = %event.event_id, direction = %event.direction, "Execution failed: {}", e);
                health.increment_reconnect(EXECUTOR_FEED);
                if let Some(notifier) = self.notifications_enabled() {
                    let alert = format_execution_error(&event.symbol, event.direction, &e.to_string());
                    if let Err(e) = notifier.send_message(&alert).await {
                        debug!("Execution error alert not delivered: {}", e);
                    }
                }
            }
        }
    }
}

/// Run Layer3 until `stop` fires
pub async fn run_layer3(
    config: Layer3Config,
    clients: Layer3Clients,
    input: EventReceiver<PrePumpEvent>,
    out: EventSender<ExecutionEvent>,
    health: Arc<HealthCounters>,
    stop: CancellationToken,
) -> Result<()> {
    if config.is_live() && clients.orders.is_none() {
        return Err(Error::ExecutionClientMissing);
    }

    let cadence = config.cadence();
    let recv_timeout = cadence.max(MIN_RECV_TIMEOUT);
    info!(
        symbol = %config.symbol,
        mode = %config.execution_mode,
        execution = config.enable_execution,
        telegram = config.telegram.enabled,
        "Layer3 started"
    );
    let mut executor = Executor::new(config, clients);

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = input.recv_timeout(recv_timeout) => event,
        };
        let Some(event) = event else {
            continue;
        };
        executor.handle(event, &out, &health).await;
        if sleep_or_stop(&stop, cadence).await {
            break;
        }
    }

    info!("Layer3 stopped");
    Ok(())
}
