//! Health report text and public API checks

use reqwest::Client;
use std::time::Duration;

use crate::config::{Config, ExchangeEndpoints};
use crate::error::Error;
use crate::exchange::http::join;
use crate::exchange::BinanceFuturesClient;
use crate::health::HealthSnapshot;

const RULE: &str = "================================";
const CHECK_TIMEOUT: Duration = Duration::from_secs(8);
const CHECK_ATTEMPTS: usize = 2;
const OKX_FALLBACK_REST: &str = "https://my.okx.com";

/// Outcome of one reachability or credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCheck {
    pub ok: bool,
    pub detail: String,
}

impl ApiCheck {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Everything a report renders. Empty `env_presence` / `api_checks` omit
/// their sections, which is how the periodic pipeline log uses it.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub symbol: String,
    pub mode: String,
    /// Queue depth after layer0..layer3
    pub queue_sizes: [usize; 4],
    pub layers: [HealthSnapshot; 4],
    pub env_presence: Vec<(String, bool)>,
    pub api_checks: Vec<(String, ApiCheck)>,
}

fn status_line(label: &str, ok: bool, detail: &str) -> String {
    let icon = if ok { "OK" } else { "FAIL" };
    format!("{:<20} : {:<4} {}", label, icon, detail).trim_end().to_string()
}

pub fn format_health_report(report: &HealthReport) -> String {
    let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut lines = vec![
        format!("PHANTOM HEALTH - {}", report.symbol),
        RULE.to_string(),
        format!("{:<20} : {}", "timestamp", ts),
        format!("{:<20} : {}", "mode", report.mode),
    ];

    if !report.env_presence.is_empty() {
        lines.push(String::new());
        lines.push("ENV".to_string());
        for (name, present) in &report.env_presence {
            lines.push(status_line(name, *present, ""));
        }
    }

    if !report.api_checks.is_empty() {
        lines.push(String::new());
        lines.push("API".to_string());
        for (name, check) in &report.api_checks {
            lines.push(status_line(name, check.ok, &check.detail));
        }
    }

    lines.push(String::new());
    lines.push("PIPELINE".to_string());
    for (idx, size) in report.queue_sizes.iter().enumerate() {
        lines.push(format!("{:<20} : {}", format!("q_layer{}", idx), size));
    }
    for (idx, snapshot) in report.layers.iter().enumerate() {
        lines.push(format!(
            "{:<20}: emitted={} reconnects={} queue_drops={} stale_cycles={}",
            format!("layer{}", idx),
            snapshot.emitted_events,
            snapshot.reconnect_total(),
            snapshot.queue_drops,
            snapshot.stale_cycles
        ));
    }
    lines.push(RULE.to_string());

    format!("<pre>{}</pre>", lines.join("\n"))
}

async fn check_once(client: &Client, url: &str, query: &[(&str, String)]) -> ApiCheck {
    match client.get(url).query(query).timeout(CHECK_TIMEOUT).send().await {
        Ok(response) if response.status().as_u16() >= 400 => {
            ApiCheck::fail(format!("http_{}", response.status().as_u16()))
        }
        Ok(_) => ApiCheck::ok("reachable"),
        Err(e) => ApiCheck::fail(Error::from(e).reason_code().to_lowercase()),
    }
}

async fn check_url(client: &Client, url: &str) -> ApiCheck {
    let mut last = ApiCheck::fail("unknown");
    for _ in 0..CHECK_ATTEMPTS {
        last = check_once(client, url, &[]).await;
        if last.ok {
            break;
        }
    }
    last
}

/// OKX's global host is often unreachable from some regions; a timeout
/// there is retried against the regional host.
async fn check_okx(client: &Client, rest: &str) -> ApiCheck {
    let primary = check_url(client, &join(rest, "/api/v5/public/time")).await;
    if primary.ok || primary.detail != "timeout" {
        return primary;
    }
    let fallback = check_url(client, &join(OKX_FALLBACK_REST, "/api/v5/public/time")).await;
    if fallback.ok {
        ApiCheck::ok("reachable_fallback")
    } else {
        ApiCheck::fail(format!("primary_timeout+fallback_{}", fallback.detail))
    }
}

/// Reachability of every public upstream the pipeline depends on
pub async fn run_public_api_checks(
    client: &Client,
    endpoints: &ExchangeEndpoints,
    whale_alert_enabled: bool,
    whale_alert_api_key: &str,
) -> Vec<(String, ApiCheck)> {
    let binance = check_url(client, &join(&endpoints.binance_rest, "/fapi/v1/ping")).await;
    let bybit = check_url(client, &join(&endpoints.bybit_rest, "/v5/market/time")).await;
    let okx = check_okx(client, &endpoints.okx_rest).await;

    let whale_alert = if !whale_alert_enabled {
        ApiCheck::ok("disabled")
    } else if whale_alert_api_key.is_empty() {
        ApiCheck::fail("missing_api_key")
    } else {
        check_once(
            client,
            &join(&endpoints.whale_alert_rest, "/status"),
            &[("api_key", whale_alert_api_key.to_string())],
        )
        .await
    };

    vec![
        ("BINANCE_PUBLIC".to_string(), binance),
        ("BYBIT_PUBLIC".to_string(), bybit),
        ("OKX_PUBLIC".to_string(), okx),
        ("WHALE_ALERT".to_string(), whale_alert),
    ]
}

/// Signed account call, only meaningful for live execution
pub async fn run_binance_auth_check(client: &Client, config: &Config) -> ApiCheck {
    let l3 = &config.layer3;
    if !l3.enable_execution || !l3.is_live() {
        return ApiCheck::ok("skipped_non_live");
    }
    let futures = match BinanceFuturesClient::new(client.clone(), &config.endpoints, &l3.binance) {
        Ok(futures) => futures,
        Err(_) => return ApiCheck::fail("missing_keys"),
    };
    match futures.account_balance_count().await {
        Ok(count) => ApiCheck::ok(format!("ok_balances={}", count)),
        Err(e) => ApiCheck::fail(e.reason_code().to_lowercase()),
    }
}
