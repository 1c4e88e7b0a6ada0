//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ExecutionMode};
use crate::exchange::http::build_client;
use crate::notify::health_report::{run_binance_auth_check, run_public_api_checks};
use crate::notify::{format_health_report, HealthReport};
use crate::pipeline::{self, Collaborators, PipelineHealth};

/// Environment variables holding credentials, in report order
pub const CREDENTIAL_VARS: [&str; 5] = [
    "BINANCE_API_KEY",
    "BINANCE_API_SECRET",
    "TG_BOT_TOKEN",
    "TG_CHAT_ID",
    "WHALE_ALERT_API_KEY",
];

/// Overrides accepted by `run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub symbol: Option<String>,
    pub mode: Option<ExecutionMode>,
    pub no_telegram: bool,
    pub no_execution: bool,
    /// Skip the live-mode confirmation prompt
    pub yes: bool,
}

fn fill(slot: &mut String, value: Option<String>) {
    if slot.is_empty() {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            *slot = value.trim().to_string();
        }
    }
}

/// Fill credentials missing from the config file via `lookup`
pub fn apply_credentials<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let l3 = &mut config.layer3;
    fill(&mut l3.binance.api_key, lookup("BINANCE_API_KEY"));
    fill(&mut l3.binance.api_secret, lookup("BINANCE_API_SECRET"));
    fill(&mut l3.telegram.bot_token, lookup("TG_BOT_TOKEN"));
    fill(&mut l3.telegram.chat_id, lookup("TG_CHAT_ID"));
    fill(&mut config.layer1.whale_alert.api_key, lookup("WHALE_ALERT_API_KEY"));
}

/// Fill credentials from the process environment
pub fn apply_env_credentials(config: &mut Config) {
    apply_credentials(config, |name| std::env::var(name).ok());
}

pub fn apply_run_options(config: &mut Config, options: &RunOptions) {
    if let Some(symbol) = &options.symbol {
        config.set_symbol(symbol);
    }
    if let Some(mode) = options.mode {
        config.layer3.execution_mode = mode;
    }
    if options.no_telegram {
        config.layer3.telegram.enabled = false;
    }
    if options.no_execution {
        config.layer3.enable_execution = false;
    }
}

/// Start the pipeline and block until Ctrl-C
pub async fn run(mut config: Config, options: RunOptions) -> Result<()> {
    apply_run_options(&mut config, &options);
    config.validate()?;
    config.validate_credentials()?;

    if config.layer3.is_live() {
        warn!("LIVE mode: real orders will be placed on Binance USD-M futures");
        if !options.yes {
            let confirmed = Confirm::new()
                .with_prompt(format!(
                    "Place live orders for {} with quantity {}?",
                    config.layer3.symbol, config.layer3.fixed_quantity
                ))
                .default(false)
                .interact()
                .context("Failed to read confirmation")?;
            if !confirmed {
                info!("Live run cancelled");
                return Ok(());
            }
        }
    }

    info!(
        symbol = %config.layer0.symbol,
        mode = %config.layer3.execution_mode,
        execution = config.layer3.enable_execution,
        telegram = config.layer3.telegram.enabled,
        "Starting phantom pipeline"
    );

    let collaborators = Collaborators::from_config(&config).context("Failed to build exchange clients")?;
    let stop = CancellationToken::new();
    let ctrl_c = pipeline::cancel_on_ctrl_c(stop.clone());

    pipeline::run(config, collaborators, PipelineHealth::default(), stop.clone()).await?;
    stop.cancel();
    let _ = ctrl_c.await;
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check credentials presence and upstream reachability
pub async fn health(config: &Config) -> Result<()> {
    let http = build_client(config.endpoints.http_timeout())?;

    let mut env_presence: Vec<(String, bool)> = CREDENTIAL_VARS
        .iter()
        .map(|name| (name.to_string(), credential_present(config, name)))
        .collect();
    env_presence.retain(|(name, _)| !name.starts_with("WHALE") || config.layer1.whale_alert.enabled);

    let mut api_checks = run_public_api_checks(
        &http,
        &config.endpoints,
        config.layer1.whale_alert.enabled,
        &config.layer1.whale_alert.api_key,
    )
    .await;
    api_checks.push(("BINANCE_AUTH".to_string(), run_binance_auth_check(&http, config).await));

    let all_ok = api_checks.iter().all(|(_, check)| check.ok);
    let report = HealthReport {
        symbol: config.layer0.symbol.clone(),
        mode: config.layer3.execution_mode.to_string(),
        env_presence,
        api_checks,
        ..Default::default()
    };
    println!("{}", format_health_report(&report));

    if all_ok {
        println!("All systems healthy!");
    } else {
        println!("Some checks failed. See the report above.");
    }
    Ok(())
}

fn credential_present(config: &Config, name: &str) -> bool {
    let value = match name {
        "BINANCE_API_KEY" => &config.layer3.binance.api_key,
        "BINANCE_API_SECRET" => &config.layer3.binance.api_secret,
        "TG_BOT_TOKEN" => &config.layer3.telegram.bot_token,
        "TG_CHAT_ID" => &config.layer3.telegram.chat_id,
        "WHALE_ALERT_API_KEY" => &config.layer1.whale_alert.api_key,
        _ => return false,
    };
    !value.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_credentials_fill_only_missing_values() {
        let mut config = Config::default();
        config.layer3.telegram.chat_id = "from-file".to_string();

        let env: HashMap<&str, &str> = [
            ("BINANCE_API_KEY", " key "),
            ("TG_CHAT_ID", "from-env"),
            ("TG_BOT_TOKEN", "   "),
        ]
        .into_iter()
        .collect();
        apply_credentials(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.layer3.binance.api_key, "key");
        assert_eq!(config.layer3.binance.api_secret, "");
        assert_eq!(config.layer3.telegram.chat_id, "from-file");
        assert_eq!(config.layer3.telegram.bot_token, "");
        assert!(credential_present(&config, "BINANCE_API_KEY"));
        assert!(!credential_present(&config, "WHALE_ALERT_API_KEY"));
    }

    #[test]
    fn test_run_options_override_config() {
        let mut config = Config::default();
        config.layer3.telegram.enabled = true;
        let options = RunOptions {
            symbol: Some("ethusdt".to_string()),
            mode: Some(ExecutionMode::Live),
            no_telegram: true,
            no_execution: true,
            yes: false,
        };
        apply_run_options(&mut config, &options);

        assert_eq!(config.layer1.symbol, "ETHUSDT");
        assert_eq!(config.layer3.symbol, "ETHUSDT");
        assert_eq!(config.layer3.execution_mode, ExecutionMode::Live);
        assert!(!config.layer3.telegram.enabled);
        // Live mode with execution disabled never places orders
        assert!(!config.layer3.is_live());
    }
}
