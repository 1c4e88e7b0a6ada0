//! Telegram Bot API transport

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::Notifier;
use crate::config::{ExchangeEndpoints, TelegramConfig};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

pub struct TelegramNotifier {
    http: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(http: Client, endpoints: &ExchangeEndpoints, config: &TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() || config.chat_id.is_empty() {
            return Err(Error::MissingCredential(
                "TG_BOT_TOKEN and TG_CHAT_ID are required for telegram notifications".to_string(),
            ));
        }
        Ok(Self {
            http,
            api_base: endpoints.telegram_api.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram_bot"
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            // reqwest errors embed the URL, which carries the bot token
            .map_err(|e| Error::Notification(e.without_url().to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Notification(e.without_url().to_string()))?;

        if !status.is_success() || payload.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                endpoint: format!("sendMessage ({})", description),
            });
        }

        debug!(chat_id = %self.chat_id, chars = text.len(), "Telegram message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_token_and_chat() {
        let config = TelegramConfig {
            enabled: true,
            bot_token: "123:abc".to_string(),
            chat_id: String::new(),
        };
        let result = TelegramNotifier::new(Client::new(), &ExchangeEndpoints::default(), &config);
        assert!(matches!(result, Err(Error::MissingCredential(_))));
    }

    #[test]
    fn test_method_url() {
        let config = TelegramConfig {
            enabled: true,
            bot_token: "123:abc".to_string(),
            chat_id: "42".to_string(),
        };
        let notifier = TelegramNotifier::new(Client::new(), &ExchangeEndpoints::default(), &config).unwrap();
        assert_eq!(
            notifier.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn test_payload_shape() {
        let body = SendMessage {
            chat_id: "42",
            text: "<pre>hi</pre>",
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["parse_mode"], "HTML");
        assert_eq!(value["disable_web_page_preview"], true);
    }
}
