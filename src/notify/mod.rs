//! Operator notifications
//!
//! - Chat transport (Telegram Bot API)
//! - Signal and error message formatting
//! - Health report formatting and public API checks

use async_trait::async_trait;

use crate::error::Result;

pub mod formatter;
pub mod health_report;
pub mod telegram;

pub use formatter::{format_execution_error, format_signal};
pub use health_report::{format_health_report, HealthReport};
pub use telegram::TelegramNotifier;

/// Outbound text channel; messages are HTML formatted
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
