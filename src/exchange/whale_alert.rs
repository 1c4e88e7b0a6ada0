//! Whale Alert stablecoin exchange-inflow estimate

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::http::{get_json, join};
use super::StablecoinFlowSource;
use crate::config::{ExchangeEndpoints, WhaleAlertConfig};
use crate::error::{Error, Result};
use crate::types::{now_ms, StablecoinFlowObservation};

pub const NAME: &str = "whale_alert";

/// Look-back for each poll
const LOOKBACK_SECONDS: i64 = 120;

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<Transaction>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    to: Option<Owner>,
    #[serde(default)]
    amount_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    #[serde(default)]
    owner_type: Option<String>,
}

pub struct WhaleAlertClient {
    http: Client,
    base_url: String,
    api_key: String,
    min_transfer_usd: f64,
}

impl WhaleAlertClient {
    pub fn new(http: Client, endpoints: &ExchangeEndpoints, config: &WhaleAlertConfig) -> Self {
        Self {
            http,
            base_url: endpoints.whale_alert_rest.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            min_transfer_usd: config.min_transfer_usd,
        }
    }
}

#[async_trait]
impl StablecoinFlowSource for WhaleAlertClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_inflow_usd(&self) -> Result<StablecoinFlowObservation> {
        if self.api_key.is_empty() {
            return Err(Error::MissingCredential("WHALE_ALERT_API_KEY".to_string()));
        }

        let now_s = now_ms() / 1000;
        let params = [
            ("api_key", self.api_key.clone()),
            ("start", (now_s - LOOKBACK_SECONDS).to_string()),
            ("currency", "usdt".to_string()),
            ("min_value", (self.min_transfer_usd as i64).to_string()),
        ];
        let payload = get_json(&self.http, &join(&self.base_url, "/transactions"), &params).await?;

        Ok(StablecoinFlowObservation {
            source: NAME.to_string(),
            inflow_usd: exchange_inflow_usd(payload)?,
            ts_ms: now_s * 1000,
        })
    }
}

/// Sum USD value of transfers landing on exchange-owned wallets
fn exchange_inflow_usd(payload: Value) -> Result<f64> {
    let response: TransactionsResponse =
        serde_json::from_value(payload).map_err(|e| Error::Decode(format!("whale alert: {}", e)))?;

    Ok(response
        .transactions
        .iter()
        .filter(|tx| {
            tx.to
                .as_ref()
                .and_then(|to| to.owner_type.as_deref())
                .is_some_and(|owner| owner.eq_ignore_ascii_case("exchange"))
        })
        .filter_map(|tx| tx.amount_usd)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sums_only_exchange_destinations() {
        let payload = json!({
            "result": "success",
            "transactions": [
                {"to": {"owner_type": "exchange"}, "amount_usd": 2_500_000.0},
                {"to": {"owner_type": "unknown"}, "amount_usd": 9_000_000.0},
                {"to": {"owner_type": "Exchange"}, "amount_usd": 1_000_000.0},
                {"to": null, "amount_usd": 5_000_000.0},
                {"to": {"owner_type": "exchange"}}
            ]
        });
        assert_eq!(exchange_inflow_usd(payload).unwrap(), 3_500_000.0);
        assert_eq!(exchange_inflow_usd(json!({})).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_error() {
        let client = WhaleAlertClient::new(
            Client::new(),
            &ExchangeEndpoints::default(),
            &WhaleAlertConfig::default(),
        );
        let err = client.fetch_inflow_usd().await.unwrap_err();
        assert!(matches!(err, Error::MissingCredential(_)));
    }
}
