//! Bybit v5 linear perpetuals

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{get_json, join};
use super::lenient;
use super::ws::{connect_text_stream, decode_frames};
use super::{ExchangeClient, FeedStream};
use crate::config::ExchangeEndpoints;
use crate::error::{Error, Result};
use crate::types::{now_ms, Direction, ExchangeSnapshot, LiquidationUpdate};

pub const NAME: &str = "bybit";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Option::default")]
    result: Option<ResultList<T>>,
}

#[derive(Debug, Deserialize)]
struct ResultList<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestRow {
    #[serde(deserialize_with = "lenient::f64")]
    open_interest: f64,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerRow {
    #[serde(deserialize_with = "lenient::f64")]
    funding_rate: f64,
    #[serde(deserialize_with = "lenient::f64")]
    mark_price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiquidationRow {
    #[serde(default)]
    side: String,
    #[serde(deserialize_with = "lenient::f64")]
    price: f64,
    #[serde(deserialize_with = "lenient::f64")]
    size: f64,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    updated_time: Option<i64>,
    #[serde(rename = "T", default, deserialize_with = "lenient::opt_i64")]
    trade_time: Option<i64>,
}

pub struct BybitClient {
    http: Client,
    rest: String,
    ws: String,
}

impl BybitClient {
    pub fn new(http: Client, endpoints: &ExchangeEndpoints) -> Self {
        Self {
            http,
            rest: endpoints.bybit_rest.trim_end_matches('/').to_string(),
            ws: endpoints.bybit_ws.clone(),
        }
    }
}

fn topic(symbol: &str) -> String {
    format!("allLiquidation.{}", symbol)
}

#[async_trait]
impl ExchangeClient for BybitClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<ExchangeSnapshot> {
        let oi_params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("intervalTime", "5min".to_string()),
            ("limit", "1".to_string()),
        ];
        let ticker_params = [("category", "linear".to_string()), ("symbol", symbol.to_string())];

        let oi = get_json(&self.http, &join(&self.rest, "/v5/market/open-interest"), &oi_params).await?;
        let tickers = get_json(&self.http, &join(&self.rest, "/v5/market/tickers"), &ticker_params).await?;

        parse_snapshot(symbol, oi, tickers)
    }

    async fn stream_liquidations(&self, symbol: &str) -> Result<FeedStream<LiquidationUpdate>> {
        let subscribe = json!({"op": "subscribe", "args": [topic(symbol)]}).to_string();
        let frames = connect_text_stream(&self.ws, Some(subscribe)).await?;
        let symbol = symbol.to_string();
        Ok(decode_frames(frames, move |text| parse_liquidations(text, &symbol)))
    }
}

fn first_row<T: for<'de> Deserialize<'de>>(payload: Value, what: &str) -> Result<Option<T>> {
    let envelope: Envelope<T> =
        serde_json::from_value(payload).map_err(|e| Error::Decode(format!("bybit {}: {}", what, e)))?;
    Ok(envelope.result.and_then(|r| r.list.into_iter().next()))
}

fn parse_snapshot(symbol: &str, oi: Value, tickers: Value) -> Result<ExchangeSnapshot> {
    let oi_row: Option<OpenInterestRow> = first_row(oi, "open-interest")?;
    let ticker_row: Option<TickerRow> = first_row(tickers, "tickers")?;
    let (Some(oi_row), Some(ticker_row)) = (oi_row, ticker_row) else {
        return Err(Error::ExchangeRejected("Bybit returned an empty payload".to_string()));
    };

    Ok(ExchangeSnapshot {
        exchange: NAME.to_string(),
        symbol: symbol.to_string(),
        open_interest: Some(oi_row.open_interest),
        funding_rate: Some(ticker_row.funding_rate),
        mark_price: Some(ticker_row.mark_price),
        ts_ms: oi_row.timestamp.unwrap_or_else(now_ms),
        active: true,
        error: None,
    })
}

/// Decode an `allLiquidation` push; other topics and acks yield nothing
fn parse_liquidations(text: &str, symbol: &str) -> Result<Vec<LiquidationUpdate>> {
    let payload: Value = serde_json::from_str(text)?;
    if payload.get("topic").and_then(Value::as_str) != Some(topic(symbol).as_str()) {
        return Ok(Vec::new());
    }
    let rows: Vec<LiquidationRow> = match payload.get("data") {
        Some(data) => serde_json::from_value(data.clone())
            .map_err(|e| Error::Decode(format!("bybit allLiquidation: {}", e)))?,
        None => Vec::new(),
    };

    Ok(rows
        .into_iter()
        .map(|row| LiquidationUpdate {
            exchange: NAME.to_string(),
            symbol: symbol.to_string(),
            price: row.price,
            quantity: row.size,
            notional: row.price * row.size,
            liquidated_side: if row.side.eq_ignore_ascii_case("SELL") {
                Direction::Long
            } else {
                Direction::Short
            },
            ts_ms: row.updated_time.or(row.trade_time).unwrap_or_else(now_ms),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot() {
        let snapshot = parse_snapshot(
            "BTCUSDT",
            json!({"result": {"list": [{"openInterest": "50210.3", "timestamp": "1700000000000"}]}}),
            json!({"result": {"list": [{"fundingRate": "0.0001", "markPrice": "62960.5"}]}}),
        )
        .unwrap();
        assert_eq!(snapshot.exchange, "bybit");
        assert_eq!(snapshot.open_interest, Some(50_210.3));
        assert_eq!(snapshot.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_empty_payload_is_error() {
        let err = parse_snapshot(
            "BTCUSDT",
            json!({"result": {"list": []}}),
            json!({"result": {"list": [{"fundingRate": "0.0001", "markPrice": "1"}]}}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ExchangeRejected(_)));
    }

    #[test]
    fn test_missing_result_or_list_is_empty() {
        let none: Option<OpenInterestRow> = first_row(json!({"retCode": 10001, "retMsg": "params error"}), "oi").unwrap();
        assert!(none.is_none());
        let none: Option<TickerRow> = first_row(json!({"result": {}}), "tickers").unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_parse_liquidations() {
        let frame = r#"{"topic":"allLiquidation.BTCUSDT","data":[
            {"side":"Sell","price":"62000","size":"0.2","updatedTime":1700000000000},
            {"side":"Buy","price":"63000","size":"0.1","updatedTime":1700000000001}
        ]}"#;
        let updates = parse_liquidations(frame, "BTCUSDT").unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].liquidated_side, Direction::Long);
        assert_eq!(updates[1].liquidated_side, Direction::Short);
        assert_eq!(updates[1].notional, 6_300.0);

        let ack = r#"{"success":true,"op":"subscribe"}"#;
        assert!(parse_liquidations(ack, "BTCUSDT").unwrap().is_empty());
    }
}
