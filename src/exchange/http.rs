//! Shared REST helpers

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::error::{Error, Result};

/// Build the HTTP client shared by all REST adapters
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("phantom-pipeline/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// GET `url` with query params and decode the JSON body, failing on non-2xx
pub async fn get_json(client: &Client, url: &str, query: &[(&str, String)]) -> Result<Value> {
    let response = client.get(url).query(query).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            status: status.as_u16(),
            endpoint: url.to_string(),
        });
    }
    Ok(response.json::<Value>().await?)
}

/// Join a base URL and a path without doubling slashes
pub fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(
            join("https://fapi.binance.com/", "/fapi/v1/ping"),
            "https://fapi.binance.com/fapi/v1/ping"
        );
    }
}
