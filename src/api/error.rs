//! Gateway error kinds. Callers branch on `is_retryable`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited by exchange (HTTP {0})")]
    RateLimited(u16),

    #[error("Exchange unavailable: {status} - {body}")]
    Unavailable { status: u16, body: String },

    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Insufficient candles for {symbol}: {got} < {min}")]
    InsufficientData {
        symbol: String,
        got: usize,
        min: usize,
    },

    #[error("Order for {symbol} timed out after {timeout:?}")]
    OrderTimeout { symbol: String, timeout: Duration },

    #[error("Order for {symbol} not filled: {reason}")]
    OrderRejected { symbol: String, reason: String },
}

impl GatewayError {
    /// Transport hiccups, throttling, and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::RateLimited(_) | GatewayError::Unavailable { .. } => true,
            _ => false,
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            418 | 429 => GatewayError::RateLimited(status),
            401 | 403 => GatewayError::Auth(body),
            s if s >= 500 => GatewayError::Unavailable { status, body },
            _ => match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => GatewayError::Api {
                    code: err.code,
                    message: err.msg,
                },
                Err(_) => GatewayError::Api {
                    code: i64::from(status),
                    message: body,
                },
            },
        }
    }
}

#[derive(serde::Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}
