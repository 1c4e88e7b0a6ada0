//! Exchange collaborators
//!
//! The layers only ever hold these capability traits. Concrete adapters
//! (Binance, Bybit, OKX, Whale Alert) are thin REST/WebSocket wrappers that
//! do wire parsing and nothing else.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{
    Candle, Direction, ExchangeSnapshot, LiquidationUpdate, OrderBookTick,
    StablecoinFlowObservation, TradeTick,
};

pub mod binance;
pub mod binance_futures;
pub mod bybit;
pub mod http;
pub mod okx;
pub mod whale_alert;
pub mod ws;

pub use binance::BinanceClient;
pub use binance_futures::BinanceFuturesClient;
pub use bybit::BybitClient;
pub use okx::OkxClient;
pub use whale_alert::WhaleAlertClient;

/// Boxed stream of fallible items; ending (`None`) means the feed dropped
pub type FeedStream<T> = BoxStream<'static, Result<T>>;

/// Per-exchange OI/funding/mark snapshots plus forced-liquidation feed
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_snapshot(&self, symbol: &str) -> Result<ExchangeSnapshot>;

    async fn stream_liquidations(&self, symbol: &str) -> Result<FeedStream<LiquidationUpdate>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait TradeStream: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_trades(&self, symbol: &str) -> Result<FeedStream<TradeTick>>;
}

#[async_trait]
pub trait BookTickerStream: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_book_ticker(&self, symbol: &str) -> Result<FeedStream<OrderBookTick>>;
}

#[async_trait]
pub trait StablecoinFlowSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_inflow_usd(&self) -> Result<StablecoinFlowObservation>;
}

#[async_trait]
pub trait CandleSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// (entry side, exit side) for a position direction
    pub fn for_direction(direction: Direction) -> (OrderSide, OrderSide) {
        match direction {
            Direction::Long => (OrderSide::Buy, OrderSide::Sell),
            Direction::Short => (OrderSide::Sell, OrderSide::Buy),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// One futures order leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    /// `MARK_PRICE` for conditional exits
    pub working_type: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            stop_price: None,
            reduce_only: false,
            working_type: None,
        }
    }

    /// Reduce-only conditional exit triggered off the mark price
    pub fn exit(symbol: &str, side: OrderSide, order_type: OrderType, stop_price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            stop_price: Some(stop_price),
            reduce_only: true,
            working_type: Some("MARK_PRICE".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: Option<String>,
    pub avg_price: Option<f64>,
    pub price: Option<f64>,
    /// Untouched exchange payload
    pub raw: serde_json::Value,
}

impl OrderResponse {
    /// Fill price: average price first, then order price; only positive values count
    pub fn fill_price(&self) -> Option<f64> {
        [self.avg_price, self.price]
            .into_iter()
            .flatten()
            .find(|p| *p > 0.0)
    }

    pub fn order_id_or_na(&self) -> String {
        self.order_id.clone().unwrap_or_else(|| "n/a".to_string())
    }
}

/// Order placement for live execution
#[async_trait]
pub trait OrderClient: Send + Sync {
    fn name(&self) -> &str;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResponse>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Parse a number that may arrive as a JSON string or number
pub(crate) fn parse_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn parse_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

/// `deserialize_with` helpers for exchanges that quote numbers as strings
pub(crate) mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::parse_f64(&value).ok_or_else(|| D::Error::custom(format!("expected number, got {}", value)))
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(super::parse_f64))
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(super::parse_i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fill_price_prefers_avg_price() {
        let resp = OrderResponse {
            order_id: Some("1".into()),
            avg_price: Some(0.0),
            price: Some(62_959.0),
            raw: json!({}),
        };
        assert_eq!(resp.fill_price(), Some(62_959.0));

        let resp = OrderResponse::default();
        assert_eq!(resp.fill_price(), None);
        assert_eq!(resp.order_id_or_na(), "n/a");
    }

    #[test]
    fn test_sides_for_direction() {
        assert_eq!(
            OrderSide::for_direction(Direction::Short),
            (OrderSide::Sell, OrderSide::Buy)
        );
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_f64(&json!("1.5")), Some(1.5));
        assert_eq!(parse_f64(&json!(2)), Some(2.0));
        assert_eq!(parse_i64(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(parse_f64(&json!(null)), None);
    }
}
