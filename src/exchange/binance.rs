//! Binance USDⓈ-M futures market data
//!
//! One client covers every public Binance feed the pipeline reads:
//! OI/funding/mark snapshots, the forced-order stream, the raw trade and
//! book-ticker streams and klines.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::http::{get_json, join};
use super::lenient;
use super::ws::{connect_text_stream, decode_frames};
use super::{BookTickerStream, CandleSource, ExchangeClient, FeedStream, TradeStream};
use crate::config::ExchangeEndpoints;
use crate::error::{Error, Result};
use crate::types::{now_ms, Candle, Direction, ExchangeSnapshot, LiquidationUpdate, OrderBookTick, TradeTick};

pub const NAME: &str = "binance";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestResponse {
    #[serde(deserialize_with = "lenient::f64")]
    open_interest: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndexResponse {
    #[serde(deserialize_with = "lenient::f64")]
    last_funding_rate: f64,
    #[serde(deserialize_with = "lenient::f64")]
    mark_price: f64,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    time: Option<i64>,
}

/// `o` object of a `forceOrder` event
#[derive(Debug, Deserialize)]
struct ForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "p", deserialize_with = "lenient::f64")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "lenient::f64")]
    quantity: f64,
    #[serde(rename = "T", default, deserialize_with = "lenient::opt_i64")]
    trade_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "e", default)]
    event_type: String,
    #[serde(rename = "s", default)]
    symbol: String,
    #[serde(rename = "p", deserialize_with = "lenient::f64")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "lenient::f64")]
    quantity: f64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    #[serde(rename = "T", default, deserialize_with = "lenient::opt_i64")]
    trade_time: Option<i64>,
    #[serde(rename = "E", default, deserialize_with = "lenient::opt_i64")]
    event_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawBookTicker {
    #[serde(rename = "s", default)]
    symbol: String,
    #[serde(rename = "b", deserialize_with = "lenient::f64")]
    bid_price: f64,
    #[serde(rename = "B", deserialize_with = "lenient::f64")]
    bid_qty: f64,
    #[serde(rename = "a", deserialize_with = "lenient::f64")]
    ask_price: f64,
    #[serde(rename = "A", deserialize_with = "lenient::f64")]
    ask_qty: f64,
    #[serde(rename = "E", default, deserialize_with = "lenient::opt_i64")]
    event_time: Option<i64>,
}

/// Binance public futures client
pub struct BinanceClient {
    http: Client,
    rest: String,
    liquidation_ws: String,
    stream_root: String,
}

impl BinanceClient {
    pub fn new(http: Client, endpoints: &ExchangeEndpoints) -> Self {
        Self {
            http,
            rest: endpoints.binance_rest.trim_end_matches('/').to_string(),
            liquidation_ws: endpoints.binance_ws.clone(),
            stream_root: endpoints.binance_trade_ws.trim_end_matches('/').to_string(),
        }
    }

    fn stream_url(&self, symbol: &str, stream: &str) -> String {
        format!("{}/{}@{}", self.stream_root, symbol.to_lowercase(), stream)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<ExchangeSnapshot> {
        let params = [("symbol", symbol.to_string())];

        let oi = get_json(&self.http, &join(&self.rest, "/fapi/v1/openInterest"), &params).await?;
        let premium = get_json(&self.http, &join(&self.rest, "/fapi/v1/premiumIndex"), &params).await?;

        parse_snapshot(symbol, oi, premium)
    }

    async fn stream_liquidations(&self, symbol: &str) -> Result<FeedStream<LiquidationUpdate>> {
        let frames = connect_text_stream(&self.liquidation_ws, None).await?;
        let symbol = symbol.to_string();
        Ok(decode_frames(frames, move |text| {
            Ok(parse_force_order(text, &symbol)?.into_iter().collect())
        }))
    }
}

#[async_trait]
impl TradeStream for BinanceClient {
    fn name(&self) -> &str {
        "binance_trades"
    }

    async fn stream_trades(&self, symbol: &str) -> Result<FeedStream<TradeTick>> {
        let frames = connect_text_stream(&self.stream_url(symbol, "trade"), None).await?;
        let symbol = symbol.to_uppercase();
        Ok(decode_frames(frames, move |text| {
            Ok(parse_trade(text, &symbol)?.into_iter().collect())
        }))
    }
}

#[async_trait]
impl BookTickerStream for BinanceClient {
    fn name(&self) -> &str {
        "binance_book"
    }

    async fn stream_book_ticker(&self, symbol: &str) -> Result<FeedStream<OrderBookTick>> {
        let frames = connect_text_stream(&self.stream_url(symbol, "bookTicker"), None).await?;
        let symbol = symbol.to_uppercase();
        Ok(decode_frames(frames, move |text| {
            Ok(parse_book_ticker(text, &symbol)?.into_iter().collect())
        }))
    }
}

#[async_trait]
impl CandleSource for BinanceClient {
    fn name(&self) -> &str {
        "binance_candles"
    }

    async fn fetch_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let payload = get_json(&self.http, &join(&self.rest, "/fapi/v1/klines"), &params).await?;
        parse_klines(&payload)
    }
}

fn parse_snapshot(symbol: &str, oi: Value, premium: Value) -> Result<ExchangeSnapshot> {
    let oi: OpenInterestResponse =
        serde_json::from_value(oi).map_err(|e| Error::Decode(format!("binance openInterest: {}", e)))?;
    let premium: PremiumIndexResponse =
        serde_json::from_value(premium).map_err(|e| Error::Decode(format!("binance premiumIndex: {}", e)))?;

    Ok(ExchangeSnapshot {
        exchange: NAME.to_string(),
        symbol: symbol.to_string(),
        open_interest: Some(oi.open_interest),
        funding_rate: Some(premium.last_funding_rate),
        mark_price: Some(premium.mark_price),
        ts_ms: premium.time.unwrap_or_else(now_ms),
        active: true,
        error: None,
    })
}

/// Decode one `!forceOrder@arr` frame (combined-stream envelope optional)
fn parse_force_order(text: &str, symbol: &str) -> Result<Option<LiquidationUpdate>> {
    let payload: Value = serde_json::from_str(text)?;
    let event = payload.get("data").unwrap_or(&payload);
    let Some(order) = event.get("o") else {
        return Ok(None);
    };
    let order: ForceOrder = serde_json::from_value(order.clone())
        .map_err(|e| Error::Decode(format!("binance forceOrder: {}", e)))?;
    if order.symbol != symbol {
        return Ok(None);
    }

    // A SELL liquidation order closes a long position
    let liquidated_side = if order.side.eq_ignore_ascii_case("SELL") {
        Direction::Long
    } else {
        Direction::Short
    };

    Ok(Some(LiquidationUpdate {
        exchange: NAME.to_string(),
        symbol: symbol.to_string(),
        price: order.price,
        quantity: order.quantity,
        notional: order.price * order.quantity,
        liquidated_side,
        ts_ms: order.trade_time.unwrap_or_else(now_ms),
    }))
}

fn parse_trade(text: &str, symbol: &str) -> Result<Option<TradeTick>> {
    let payload: Value = serde_json::from_str(text)?;
    if payload.get("e").and_then(Value::as_str) != Some("trade") {
        return Ok(None);
    }
    let trade: RawTrade =
        serde_json::from_value(payload).map_err(|e| Error::Decode(format!("binance trade: {}", e)))?;
    if trade.event_type != "trade" || trade.symbol.to_uppercase() != symbol {
        return Ok(None);
    }

    Ok(Some(TradeTick {
        exchange: NAME.to_string(),
        symbol: symbol.to_string(),
        price: trade.price,
        quantity: trade.quantity,
        is_buyer_maker: trade.is_buyer_maker,
        ts_ms: trade.trade_time.or(trade.event_time).unwrap_or_else(now_ms),
    }))
}

fn parse_book_ticker(text: &str, symbol: &str) -> Result<Option<OrderBookTick>> {
    let ticker: RawBookTicker =
        serde_json::from_str(text).map_err(|e| Error::Decode(format!("binance bookTicker: {}", e)))?;
    if ticker.symbol.to_uppercase() != symbol {
        debug!(symbol = %ticker.symbol, "Ignoring book ticker for other symbol");
        return Ok(None);
    }

    Ok(Some(OrderBookTick {
        exchange: NAME.to_string(),
        symbol: symbol.to_string(),
        bid_price: ticker.bid_price,
        bid_qty: ticker.bid_qty,
        ask_price: ticker.ask_price,
        ask_qty: ticker.ask_qty,
        ts_ms: ticker.event_time.unwrap_or_else(now_ms),
    }))
}

/// Kline rows: `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_klines(payload: &Value) -> Result<Vec<Candle>> {
    let rows = payload
        .as_array()
        .ok_or_else(|| Error::Decode("binance klines: expected array".to_string()))?;

    rows.iter()
        .map(|row| {
            let field = |idx: usize| row.get(idx).ok_or_else(|| Error::Decode(format!("binance kline: missing column {}", idx)));
            let num = |idx: usize| -> Result<f64> {
                super::parse_f64(field(idx)?).ok_or_else(|| Error::Decode(format!("binance kline: bad column {}", idx)))
            };
            let int = |idx: usize| -> Result<i64> {
                super::parse_i64(field(idx)?).ok_or_else(|| Error::Decode(format!("binance kline: bad column {}", idx)))
            };
            Ok(Candle {
                open_time_ms: int(0)?,
                open: num(1)?,
                high: num(2)?,
                low: num(3)?,
                close: num(4)?,
                volume: num(5)?,
                close_time_ms: int(6)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_snapshot() {
        let snapshot = parse_snapshot(
            "BTCUSDT",
            json!({"openInterest": "81234.5", "symbol": "BTCUSDT"}),
            json!({"lastFundingRate": "-0.00012", "markPrice": "62959.10", "time": 1700000000000i64}),
        )
        .unwrap();
        assert_eq!(snapshot.open_interest, Some(81_234.5));
        assert_eq!(snapshot.funding_rate, Some(-0.00012));
        assert_eq!(snapshot.mark_price, Some(62_959.10));
        assert_eq!(snapshot.ts_ms, 1_700_000_000_000);
        assert!(snapshot.active);
    }

    #[test]
    fn test_force_order_sell_liquidates_long() {
        let frame = r#"{"stream":"!forceOrder@arr","data":{"e":"forceOrder","o":{"s":"BTCUSDT","S":"SELL","p":"62000","q":"0.5","T":1700000000123}}}"#;
        let update = parse_force_order(frame, "BTCUSDT").unwrap().unwrap();
        assert_eq!(update.liquidated_side, Direction::Long);
        assert_eq!(update.notional, 31_000.0);
        assert_eq!(update.ts_ms, 1_700_000_000_123);

        assert!(parse_force_order(frame, "ETHUSDT").unwrap().is_none());
    }

    #[test]
    fn test_parse_trade_filters_other_events() {
        let frame = r#"{"e":"trade","s":"BTCUSDT","p":"62959.1","q":"0.010","m":false,"T":1700000000000}"#;
        let trade = parse_trade(frame, "BTCUSDT").unwrap().unwrap();
        assert!(!trade.is_buyer_maker);
        assert_eq!(trade.price, 62_959.1);

        let other = r#"{"e":"aggTrade","s":"BTCUSDT"}"#;
        assert!(parse_trade(other, "BTCUSDT").unwrap().is_none());
    }

    #[test]
    fn test_parse_book_ticker() {
        let frame = r#"{"e":"bookTicker","s":"BTCUSDT","b":"62950.0","B":"3.5","a":"62950.1","A":"1.5","E":1700000000000}"#;
        let tick = parse_book_ticker(frame, "BTCUSDT").unwrap().unwrap();
        assert_eq!(tick.bid_qty, 3.5);
        assert_eq!(tick.ask_qty, 1.5);
    }

    #[test]
    fn test_parse_klines() {
        let payload = json!([
            [1700000000000i64, "100.0", "101.0", "99.5", "100.5", "12.3", 1700000059999i64, "0", 10, "0", "0", "0"]
        ]);
        let candles = parse_klines(&payload).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, 101.0);
        assert_eq!(candles[0].close_time_ms, 1_700_000_059_999);

        assert!(parse_klines(&json!([[1, "x"]])).is_err());
    }
}
