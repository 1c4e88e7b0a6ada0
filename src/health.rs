//! Per-layer health counters
//!
//! Each layer owns one `Arc<HealthCounters>`; its workers bump counters in
//! place and the reporting side reads consistent-enough snapshots without
//! taking a lock on the hot path.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct HealthCounters {
    reconnects: DashMap<String, u64>,
    stale_cycles: AtomicU64,
    queue_drops: AtomicU64,
    emitted_events: AtomicU64,
    /// 0 means nothing emitted yet
    last_emitted_ts_ms: AtomicI64,
}

/// Point-in-time copy of a layer's counters
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HealthSnapshot {
    pub reconnects: BTreeMap<String, u64>,
    pub stale_cycles: u64,
    pub queue_drops: u64,
    pub emitted_events: u64,
    pub last_emitted_ts_ms: Option<i64>,
}

impl HealthSnapshot {
    pub fn reconnect_total(&self) -> u64 {
        self.reconnects.values().sum()
    }
}

impl HealthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_reconnect(&self, name: &str) {
        *self.reconnects.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn increment_stale_cycles(&self) {
        self.stale_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queue_drops(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an emission at `ts_ms`
    pub fn mark_emitted(&self, ts_ms: i64) {
        self.last_emitted_ts_ms.store(ts_ms, Ordering::Relaxed);
        self.emitted_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnects(&self, name: &str) -> u64 {
        self.reconnects.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn reconnect_total(&self) -> u64 {
        self.reconnects.iter().map(|entry| *entry.value()).sum()
    }

    pub fn stale_cycles(&self) -> u64 {
        self.stale_cycles.load(Ordering::Relaxed)
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    pub fn emitted_events(&self) -> u64 {
        self.emitted_events.load(Ordering::Relaxed)
    }

    pub fn last_emitted_ts_ms(&self) -> Option<i64> {
        match self.last_emitted_ts_ms.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            reconnects: self
                .reconnects
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            stale_cycles: self.stale_cycles(),
            queue_drops: self.queue_drops(),
            emitted_events: self.emitted_events(),
            last_emitted_ts_ms: self.last_emitted_ts_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnects_by_name() {
        let health = HealthCounters::new();
        health.increment_reconnect("binance");
        health.increment_reconnect("binance");
        health.increment_reconnect("bybit");

        assert_eq!(health.reconnects("binance"), 2);
        assert_eq!(health.reconnects("okx"), 0);
        assert_eq!(health.reconnect_total(), 3);
    }

    #[test]
    fn test_mark_emitted() {
        let health = HealthCounters::new();
        assert_eq!(health.last_emitted_ts_ms(), None);

        health.mark_emitted(1_700_000_000_000);
        health.mark_emitted(1_700_000_001_000);

        let snap = health.snapshot();
        assert_eq!(snap.emitted_events, 2);
        assert_eq!(snap.last_emitted_ts_ms, Some(1_700_000_001_000));
    }
}
