//! Provider-neutral error taxonomy with retry strategies.
//!
//! Every provider adapter classifies its native transport/API failures into
//! one of seven categories. The category decides three things at once:
//! the HTTP status the outer layer should surface, whether the engines may
//! retry the call, and how the error is rendered as a structured payload.
//!
//! | Kind | HTTP | Retried? |
//! |------|------|----------|
//! | `Auth` | 401 | no |
//! | `InvalidRequest` | 400 | no |
//! | `NotFound` | 404 | no |
//! | `RateLimited` | 429 | yes, with backoff |
//! | `Timeout` | 504 | yes |
//! | `Server` | 5xx | yes |
//! | `Generic` | 502 | no |
//!
//! No error is silently swallowed: adapters wrap, engines count or surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for all mindforge operations.
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// Retry Strategy
// ============================================================================

/// Strategy for retrying a failed LLM operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff (transient errors).
    ExponentialBackoff {
        /// Initial delay before the first retry.
        base_delay: Duration,
        /// Ceiling for the doubled delay.
        max_delay: Duration,
        /// Total attempts, including the first.
        max_attempts: u32,
    },

    /// Wait a fixed duration, then retry once (rate limits with a reset hint).
    WaitAndRetry {
        /// Duration to wait before the single retry.
        wait: Duration,
    },

    /// Permanent error, do not retry.
    NoRetry,
}

impl RetryStrategy {
    /// Standard backoff for transient network/timeout failures.
    pub fn network_backoff(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts,
        }
    }

    /// Standard backoff for provider 5xx failures.
    pub fn server_backoff(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts,
        }
    }

    /// Whether this strategy allows another attempt.
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::NoRetry)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by providers, engines, and supporting subsystems.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Invalid or missing credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Parse failures, contract violations, bad parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown model or resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider asked us to slow down, or a local bucket refused admission.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport timeout or request deadline exceeded.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Provider-side 5xx.
    #[error("provider server error ({status}): {message}")]
    Server {
        /// HTTP status returned by the provider.
        status: u16,
        /// Provider error message.
        message: String,
    },

    /// Fallback for everything that fits no other category.
    #[error("provider error: {0}")]
    Generic(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::Generic(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidRequest(format!("serialization failed: {}", err))
    }
}

/// Structured error payload handed to the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Human-readable message.
    pub message: String,
    /// Category name, e.g. `"rate_limit_error"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// HTTP status code the category maps to.
    pub code: u16,
    /// Provider the error originated from (empty for local errors).
    pub provider: String,
    /// Optional category-specific detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LlmError {
    /// HTTP status code for this category.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::InvalidRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::RateLimited(_) => 429,
            Self::Timeout(_) => 504,
            Self::Server { status, .. } => *status,
            Self::Generic(_) => 502,
        }
    }

    /// Machine-readable category code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::NotFound(_) => "not_found_error",
            Self::RateLimited(_) => "rate_limit_error",
            Self::Timeout(_) => "timeout_error",
            Self::Server { .. } => "server_error",
            Self::Generic(_) => "provider_error",
        }
    }

    /// Retry strategy for this error, bounded by `max_retries` attempts
    /// after the first.
    pub fn retry_strategy(&self, max_retries: u32) -> RetryStrategy {
        if max_retries == 0 {
            return RetryStrategy::NoRetry;
        }
        match self {
            Self::RateLimited(_) => RetryStrategy::WaitAndRetry {
                wait: Duration::from_secs(2),
            },
            Self::Timeout(_) => RetryStrategy::network_backoff(max_retries + 1),
            Self::Server { .. } => RetryStrategy::server_backoff(max_retries + 1),
            Self::Auth(_)
            | Self::InvalidRequest(_)
            | Self::NotFound(_)
            | Self::Generic(_) => RetryStrategy::NoRetry,
        }
    }

    /// Whether the category is retryable at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }

    /// Render the error as the structured payload the HTTP layer returns.
    pub fn payload(&self, provider: &str) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            kind: self.error_code().to_string(),
            code: self.status_code(),
            provider: provider.to_string(),
            details: None,
        }
    }
}
