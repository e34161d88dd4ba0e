//! Error types for the collector core

use thiserror::Error;

use crate::decode::DecodeError;

#[derive(Error, Debug, Clone)]
pub enum CollectorError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("API error: {message} (code: {code})")]
    ApiError { code: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Not connected to cluster")]
    NotConnected,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("key '{key}' alone exceeds the {budget}-byte request URL budget")]
    UrlBudgetExceeded { key: String, budget: usize },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("sink error: {0}")]
    SinkError(String),
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            CollectorError::ConnectionError(err.to_string())
        } else if err.is_timeout() {
            CollectorError::ConnectionError(format!("timed out: {err}"))
        } else if err.is_decode() {
            CollectorError::ParseError(err.to_string())
        } else if let Some(status) = err.status() {
            CollectorError::ApiError {
                code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            CollectorError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::ParseError(err.to_string())
    }
}

impl CollectorError {
    /// Connection-level failures the API client's backoff loop should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectorError::ConnectionError(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CollectorError::Unauthorized)
            || matches!(self, CollectorError::AuthenticationFailed)
            || matches!(self, CollectorError::ApiError { code, .. } if *code == 401)
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
