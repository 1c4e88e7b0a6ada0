//! Error types for the signal pipeline

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the signal pipeline
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    // Upstream transport errors
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("{0} stream ended")]
    StreamEnded(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Exchange rejected request: {0}")]
    ExchangeRejected(String),

    // Layer3 planning / execution errors
    #[error("Unable to derive entry price: {0}")]
    EntryPriceUnavailable(String),

    #[error("Execution client is required for live mode")]
    ExecutionClientMissing,

    #[error("Order placement failed: {0}")]
    OrderPlacement(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    // Structure detector errors
    #[error("Structure detector failed: {0}")]
    Detector(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::HttpStatus { .. }
                | Error::Timeout(_)
                | Error::WebSocket(_)
                | Error::StreamEnded(_)
                | Error::Decode(_)
        )
    }

    /// Short uppercase code used when composing degrade reasons,
    /// e.g. `HTTP_403`, `TIMEOUT`, `STREAM_ENDED`.
    pub fn reason_code(&self) -> String {
        match self {
            Error::Config(_) => "CONFIG".to_string(),
            Error::MissingCredential(_) => "MISSING_CREDENTIAL".to_string(),
            Error::Http(_) => "HTTP".to_string(),
            Error::HttpStatus { status, .. } => format!("HTTP_{}", status),
            Error::Timeout(_) => "TIMEOUT".to_string(),
            Error::WebSocket(_) => "WEBSOCKET".to_string(),
            Error::StreamEnded(_) => "STREAM_ENDED".to_string(),
            Error::Decode(_) => "DECODE".to_string(),
            Error::ExchangeRejected(_) => "REJECTED".to_string(),
            Error::EntryPriceUnavailable(_) => "NO_ENTRY_PRICE".to_string(),
            Error::ExecutionClientMissing => "NO_EXECUTION_CLIENT".to_string(),
            Error::OrderPlacement(_) => "ORDER".to_string(),
            Error::Notification(_) => "NOTIFICATION".to_string(),
            Error::Detector(_) => "DETECTOR".to_string(),
            Error::Serialization(_) => "SERIALIZATION".to_string(),
            Error::Io(_) => "IO".to_string(),
            Error::Internal(_) => "INTERNAL".to_string(),
            Error::Anyhow(_) => "ERROR".to_string(),
        }
    }

    /// Degrade reason for a failure attributed to an exchange or feed.
    ///
    /// A Bybit 403 (geo-blocked REST) is reported as exactly `BYBIT_403`;
    /// everything else becomes `<NAME>_<CODE>`.
    pub fn reason_for(&self, source: &str) -> String {
        if source.eq_ignore_ascii_case("bybit") && self.to_string().contains("403") {
            return "BYBIT_403".to_string();
        }
        format!("{}_{}", source.to_uppercase(), self.reason_code())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Error::Timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return Error::HttpStatus {
                status: status.as_u16(),
                endpoint: e
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_default(),
            };
        }
        if e.is_decode() {
            return Error::Decode(e.to_string());
        }
        Error::Http(e.to_string())
    }
}

// Conversion from WebSocket errors
impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
