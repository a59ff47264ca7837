//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the sort-and-aggregate engine, covering the
//! fetch, sort, and cache taxonomies and their retry/propagation policies.
//!
//! ## Input/Output Specification
//! - **Input**: Error conditions from the source, aggregator, sorter, and cache
//! - **Output**: Structured error types with context and retry classification
//! - **Error Categories**: Fetch, Aggregation, Sort, Cache, Configuration
//!
//! ## Key Features
//! - Transient vs non-retryable fetch classification by HTTP status
//! - Cancellation propagated distinctly from failures
//! - Cache-tier failures kept degradable (never escalated past the cache)
//! - Structured logging integration

use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Comprehensive error types for the sort-and-aggregate engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network/5xx/429 failure from the paged source; retried with backoff
    #[error("transient fetch failure from '{source_name}': {details}")]
    TransientFetch {
        source_name: String,
        details: String,
        status: Option<u16>,
    },

    /// 4xx (other than 429) from the paged source; never retried
    #[error("non-retryable fetch failure ({status}): {details}")]
    NonRetryableFetch { status: u16, details: String },

    /// Aggregation exhausted its retry budget or hit a fatal page error
    #[error("aggregation failed after {attempts} attempt(s): {details}")]
    AggregationFailed { attempts: u32, details: String },

    /// An abort signal fired mid-operation; not a failure
    #[error("operation cancelled")]
    Cancelled,

    /// Background sort exceeded its deadline
    #[error("background sort exceeded {timeout_ms}ms deadline")]
    SortTimeout { timeout_ms: u64 },

    /// Sort worker failed for a reason other than timeout
    #[error("sort failed: {details}")]
    SortFailed { details: String },

    /// Durable cache tier unavailable; the engine degrades to memory-only
    #[error("durable cache unavailable: {details}")]
    CacheUnavailable { details: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("serialization failed: {message}")]
    Serialization { message: String },

    /// Embedded database errors
    #[error("database error: {0}")]
    Database(sled::Error),

    /// Internal invariant violations
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Classify an HTTP status from the paged source.
    ///
    /// 429 and 5xx are transient (retried with backoff); any other 4xx is
    /// non-retryable and surfaces immediately.
    pub fn from_http_status(source_name: &str, status: u16, details: String) -> Self {
        if status == 429 || status >= 500 {
            EngineError::TransientFetch {
                source_name: source_name.to_string(),
                details,
                status: Some(status),
            }
        } else {
            EngineError::NonRetryableFetch { status, details }
        }
    }

    /// Check whether the error is retryable under the backoff policy
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientFetch { .. })
    }

    /// Check whether the error is a cancellation (silent abandonment)
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::TransientFetch { .. }
            | EngineError::NonRetryableFetch { .. }
            | EngineError::AggregationFailed { .. } => "aggregation",
            EngineError::SortTimeout { .. } | EngineError::SortFailed { .. } => "sort",
            EngineError::CacheUnavailable { .. } | EngineError::Database(_) => "cache",
            EngineError::Cancelled => "cancelled",
            EngineError::Config { .. } => "configuration",
            EngineError::Serialization { .. } => "serialization",
            EngineError::Internal { .. } => "generic",
        }
    }
}

// Conversion from common error types
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Internal {
            message: format!("IO error: {}", err),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization {
            message: format!("JSON serialization error: {}", err),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let source_name = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("paged-source")
            .to_string();
        EngineError::TransientFetch {
            source_name,
            details: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization {
            message: format!("binary serialization error: {}", err),
        }
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(EngineError::from_http_status("api", 429, "slow down".into()).is_retryable());
        assert!(EngineError::from_http_status("api", 503, "maintenance".into()).is_retryable());
        assert!(!EngineError::from_http_status("api", 404, "gone".into()).is_retryable());
        assert!(!EngineError::from_http_status("api", 400, "bad filter".into()).is_retryable());
    }

    #[test]
    fn test_cancellation_is_not_retryable() {
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(EngineError::Cancelled.is_cancelled());
        assert_eq!(EngineError::Cancelled.category(), "cancelled");
    }
}
