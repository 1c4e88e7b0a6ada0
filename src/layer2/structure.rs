//! Market structure detection (CHoCH and order blocks)

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Candle, Direction, StructureMeta, StructureSignal};

/// Minimum candles before the heuristic will classify anything
const MIN_CANDLES: usize = 12;
/// Bars before the last one used for the recent range
const RANGE_BARS: usize = 6;
/// Bars scanned for an order block, including the last
const ORDER_BLOCK_SCAN: usize = 8;

#[async_trait]
pub trait StructureDetector: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, candles: &[Candle], direction: Direction) -> Result<StructureSignal>;
}

/// Price-action heuristic over the tail of the candle window
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDetector;

impl HeuristicDetector {
    pub const BACKEND: &'static str = "heuristic";

    pub fn classify(candles: &[Candle], direction: Direction) -> StructureSignal {
        if candles.len() < MIN_CANDLES {
            return StructureSignal {
                choch: false,
                order_block: false,
                meta: StructureMeta {
                    backend: Self::BACKEND.to_string(),
                    note: Some("INSUFFICIENT_CANDLES".to_string()),
                    ..Default::default()
                },
            };
        }

        let n = candles.len();
        let range = &candles[n - 1 - RANGE_BARS..n - 1];
        let recent_high = range.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let recent_low = range.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let last_close = candles[n - 1].close;

        let scan = &candles[n - ORDER_BLOCK_SCAN..];
        let (choch, order_block) = match direction {
            Direction::Long => (
                last_close > recent_high,
                scan.windows(2).any(|w| w[0].close < w[0].open && w[1].close > w[0].high),
            ),
            Direction::Short => (
                last_close < recent_low,
                scan.windows(2).any(|w| w[0].close > w[0].open && w[1].close < w[0].low),
            ),
        };

        let history = &candles[..n - 1];
        let nearest_ob_above = history
            .iter()
            .filter(|c| c.close < c.open && c.high > last_close)
            .map(|c| c.high)
            .reduce(f64::min);
        let nearest_ob_below = history
            .iter()
            .filter(|c| c.close > c.open && c.low < last_close)
            .map(|c| c.low)
            .reduce(f64::max);

        StructureSignal {
            choch,
            order_block,
            meta: StructureMeta {
                backend: Self::BACKEND.to_string(),
                note: None,
                recent_high: Some(recent_high),
                recent_low: Some(recent_low),
                nearest_ob_above,
                nearest_ob_below,
            },
        }
    }
}

#[async_trait]
impl StructureDetector for HeuristicDetector {
    fn name(&self) -> &str {
        Self::BACKEND
    }

    async fn detect(&self, candles: &[Candle], direction: Direction) -> Result<StructureSignal> {
        Ok(Self::classify(candles, direction))
    }
}
