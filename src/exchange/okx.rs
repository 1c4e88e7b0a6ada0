//! OKX perpetual swaps (snapshots only)

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::http::{get_json, join};
use super::lenient;
use super::{ExchangeClient, FeedStream};
use crate::config::ExchangeEndpoints;
use crate::error::{Error, Result};
use crate::types::{now_ms, ExchangeSnapshot, LiquidationUpdate};

pub const NAME: &str = "okx";

/// `BTCUSDT` -> `BTC-USDT-SWAP`; anything not quoted in USDT is passed through
pub fn okx_inst_id(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    match upper.strip_suffix("USDT") {
        Some(base) if !base.is_empty() => format!("{}-USDT-SWAP", base),
        _ => symbol.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OpenInterestRow {
    #[serde(deserialize_with = "lenient::f64")]
    oi: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingRow {
    #[serde(deserialize_with = "lenient::f64")]
    funding_rate: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkRow {
    #[serde(deserialize_with = "lenient::f64")]
    mark_px: f64,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    ts: Option<i64>,
}

pub struct OkxClient {
    http: Client,
    rest: String,
}

impl OkxClient {
    pub fn new(http: Client, endpoints: &ExchangeEndpoints) -> Self {
        Self {
            http,
            rest: endpoints.okx_rest.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ExchangeClient for OkxClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<ExchangeSnapshot> {
        let inst_id = okx_inst_id(symbol);
        let by_inst = [("instId", inst_id.clone())];
        let mark_params = [("instType", "SWAP".to_string()), ("instId", inst_id)];

        let oi = get_json(&self.http, &join(&self.rest, "/api/v5/public/open-interest"), &by_inst).await?;
        let funding = get_json(&self.http, &join(&self.rest, "/api/v5/public/funding-rate"), &by_inst).await?;
        let mark = get_json(&self.http, &join(&self.rest, "/api/v5/public/mark-price"), &mark_params).await?;

        parse_snapshot(symbol, oi, funding, mark)
    }

    /// OKX does not publish a usable public liquidation feed; the stream
    /// stays open and never yields.
    async fn stream_liquidations(&self, _symbol: &str) -> Result<FeedStream<LiquidationUpdate>> {
        Ok(futures::stream::pending().boxed())
    }
}

fn first<T: for<'de> Deserialize<'de>>(payload: Value, what: &str) -> Result<T> {
    let envelope: DataEnvelope<T> =
        serde_json::from_value(payload).map_err(|e| Error::Decode(format!("okx {}: {}", what, e)))?;
    envelope
        .data
        .into_iter()
        .next()
        .ok_or_else(|| Error::ExchangeRejected(format!("OKX returned no {} rows", what)))
}

fn parse_snapshot(symbol: &str, oi: Value, funding: Value, mark: Value) -> Result<ExchangeSnapshot> {
    let oi: OpenInterestRow = first(oi, "open-interest")?;
    let funding: FundingRow = first(funding, "funding-rate")?;
    let mark: MarkRow = first(mark, "mark-price")?;

    Ok(ExchangeSnapshot {
        exchange: NAME.to_string(),
        symbol: symbol.to_string(),
        open_interest: Some(oi.oi),
        funding_rate: Some(funding.funding_rate),
        mark_price: Some(mark.mark_px),
        ts_ms: mark.ts.unwrap_or_else(now_ms),
        active: true,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_inst_id() {
        assert_eq!(okx_inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(okx_inst_id("solusdt"), "SOL-USDT-SWAP");
        assert_eq!(okx_inst_id("BTC-USD"), "BTC-USD");
    }

    #[test]
    fn test_parse_snapshot() {
        let snapshot = parse_snapshot(
            "BTCUSDT",
            json!({"data": [{"oi": "1200345", "instId": "BTC-USDT-SWAP"}]}),
            json!({"data": [{"fundingRate": "-0.0002"}]}),
            json!({"data": [{"markPx": "62955.2", "ts": "1700000000000"}]}),
        )
        .unwrap();
        assert_eq!(snapshot.open_interest, Some(1_200_345.0));
        assert_eq!(snapshot.funding_rate, Some(-0.0002));
        assert_eq!(snapshot.ts_ms, 1_700_000_000_000);

        let err = parse_snapshot("BTCUSDT", json!({"data": []}), json!({}), json!({})).unwrap_err();
        assert!(matches!(err, Error::ExchangeRejected(_)));
    }

    #[test]
    fn test_missing_data_field_yields_no_rows() {
        let err = first::<FundingRow>(json!({"code": "51001", "msg": "Instrument ID does not exist"}), "funding-rate")
            .unwrap_err();
        assert!(matches!(err, Error::ExchangeRejected(_)));

        let row: MarkRow = first(json!({"data": [{"markPx": 1.5}]}), "mark-price").unwrap();
        assert_eq!(row.mark_px, 1.5);
        assert_eq!(row.ts, None);
    }

    #[tokio::test]
    async fn test_liquidation_stream_is_silent() {
        let client = OkxClient::new(Client::new(), &ExchangeEndpoints::default());
        let mut stream = client.stream_liquidations("BTCUSDT").await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(next.is_err());
    }
}
