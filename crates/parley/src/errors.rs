use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Failures raised while opening or reading from a backend.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Stream ended unexpectedly")]
    UnexpectedEof,

    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Upstream failure: {0}")]
    Upstream(String),
}

impl BackendError {
    /// Only upstream rate limiting is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::RateLimited(_))
    }

    /// Classify a non-success HTTP response from a provider.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = error_detail(body).unwrap_or_else(|| body.trim().to_string());
        if status == StatusCode::TOO_MANY_REQUESTS || is_rate_limit_body(body) {
            return BackendError::RateLimited(detail);
        }
        BackendError::Upstream(format!("{}: {}", status, detail))
    }

    /// Classify an `error` object embedded in an otherwise successful payload.
    pub fn from_error_value(error: &Value) -> Self {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        match error.get("code").and_then(|c| c.as_str()) {
            Some("rate_limit_exceeded") => BackendError::RateLimited(message),
            _ => BackendError::Upstream(message),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            BackendError::ConnectionRefused(err.to_string())
        } else if err.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
            BackendError::RateLimited(err.to_string())
        } else if err.is_decode() {
            BackendError::MalformedFrame(err.to_string())
        } else {
            BackendError::Upstream(err.to_string())
        }
    }
}

fn is_rate_limit_body(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/code")
                .and_then(|c| c.as_str())
                .map(|c| c == "rate_limit_exceeded")
        })
        .unwrap_or(false)
}

fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(String::from)
}

/// Violations of the canonical event ordering, or a consumer that went away.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Event {event} not allowed after {state}")]
    Protocol { event: String, state: String },

    #[error("Event consumer closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No backend registered for default model {0}")]
    UnknownModel(String),

    #[error("Failed to build backend {model}: {source}")]
    Build {
        model: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Map a dotted config path to the environment variable that sets it.
pub fn to_env_var(field_path: &str) -> String {
    format!("PARLEY_{}", field_path.replace('.', "__").to_uppercase())
}
