//! Signed Binance USDⓈ-M order placement for live execution
//!
//! Requests are signed with HMAC-SHA256 over the exact query string and
//! carry the API key in `X-MBX-APIKEY`.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info};

use super::{parse_f64, OrderClient, OrderRequest, OrderResponse};
use crate::config::{BinanceCredentials, ExchangeEndpoints};
use crate::error::{Error, Result};
use crate::types::now_ms;

type HmacSha256 = Hmac<Sha256>;

pub const NAME: &str = "binance_futures";

const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5000;

pub struct BinanceFuturesClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceFuturesClient {
    /// Fails fast when credentials are missing; live mode cannot start without them
    pub fn new(http: Client, endpoints: &ExchangeEndpoints, credentials: &BinanceCredentials) -> Result<Self> {
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(Error::MissingCredential(
                "BINANCE_API_KEY/BINANCE_API_SECRET are required for live execution".to_string(),
            ));
        }

        let base_url = if credentials.testnet {
            TESTNET_REST.to_string()
        } else {
            endpoints.binance_rest.trim_end_matches('/').to_string()
        };
        info!(base_url = %base_url, testnet = credentials.testnet, "Binance futures order client ready");

        Ok(Self {
            http,
            base_url,
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Order parameters in Binance's field names, in a stable order
fn order_params(request: &OrderRequest, timestamp_ms: i64) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbol", request.symbol.clone()),
        ("side", request.side.as_str().to_string()),
        ("type", request.order_type.as_str().to_string()),
        ("quantity", request.quantity.to_string()),
    ];
    if let Some(stop_price) = request.stop_price {
        params.push(("stopPrice", stop_price.to_string()));
    }
    if request.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }
    if let Some(working_type) = &request.working_type {
        params.push(("workingType", working_type.clone()));
    }
    params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
    params.push(("timestamp", timestamp_ms.to_string()));
    params
}

fn encode_query(params: &[(&str, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn parse_order_response(raw: Value) -> OrderResponse {
    let order_id = raw.get("orderId").and_then(|v| match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    });
    OrderResponse {
        order_id,
        avg_price: raw.get("avgPrice").and_then(parse_f64),
        price: raw.get("price").and_then(parse_f64),
        raw,
    }
}

impl BinanceFuturesClient {
    /// Signed account check; returns the number of asset balances
    pub async fn account_balance_count(&self) -> Result<usize> {
        let query = encode_query(&[
            ("recvWindow", RECV_WINDOW_MS.to_string()),
            ("timestamp", now_ms().to_string()),
        ]);
        let signature = self.sign(&query)?;
        let url = format!("{}/fapi/v2/balance?{}&signature={}", self.base_url, query, signature);

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                endpoint: "/fapi/v2/balance".to_string(),
            });
        }
        let body: Value = response.json().await?;
        Ok(body.as_array().map(Vec::len).unwrap_or(0))
    }
}

#[async_trait]
impl OrderClient for BinanceFuturesClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResponse> {
        let query = encode_query(&order_params(request, now_ms()));
        let signature = self.sign(&query)?;
        let url = format!("{}/fapi/v1/order?{}&signature={}", self.base_url, query, signature);

        debug!(
            symbol = %request.symbol,
            side = request.side.as_str(),
            order_type = request.order_type.as_str(),
            quantity = request.quantity,
            "Placing order"
        );

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;

        if !status.is_success() {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
            let code = body.get("code").cloned().unwrap_or(Value::Null);
            return Err(Error::OrderPlacement(format!(
                "{} {} rejected ({}): {} [{}]",
                request.order_type.as_str(),
                request.side.as_str(),
                status.as_u16(),
                msg,
                code
            )));
        }

        Ok(parse_order_response(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderSide, OrderType};
    use serde_json::json;

    fn credentials() -> BinanceCredentials {
        BinanceCredentials {
            api_key: "key".to_string(),
            api_secret: "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j".to_string(),
            testnet: false,
        }
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let result = BinanceFuturesClient::new(
            Client::new(),
            &ExchangeEndpoints::default(),
            &BinanceCredentials::default(),
        );
        assert!(matches!(result, Err(Error::MissingCredential(_))));
    }

    #[test]
    fn test_signature_matches_documented_example() {
        let client = BinanceFuturesClient::new(Client::new(), &ExchangeEndpoints::default(), &credentials()).unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_exit_order_params() {
        let request = OrderRequest::exit("BTCUSDT", OrderSide::Sell, OrderType::StopMarket, 62_680.0, 0.001);
        let query = encode_query(&order_params(&request, 1_700_000_000_000));
        assert_eq!(
            query,
            "symbol=BTCUSDT&side=SELL&type=STOP_MARKET&quantity=0.001&stopPrice=62680&reduceOnly=true&workingType=MARK_PRICE&recvWindow=5000&timestamp=1700000000000"
        );
    }

    #[test]
    fn test_parse_order_response() {
        let response = parse_order_response(json!({"orderId": 283194212, "avgPrice": "62961.40", "price": "0"}));
        assert_eq!(response.order_id.as_deref(), Some("283194212"));
        assert_eq!(response.fill_price(), Some(62_961.4));
    }

    #[test]
    fn test_testnet_base_url() {
        let mut creds = credentials();
        creds.testnet = true;
        let client = BinanceFuturesClient::new(Client::new(), &ExchangeEndpoints::default(), &creds).unwrap();
        assert_eq!(client.base_url, TESTNET_REST);
    }
}
