//! # Aggregator Module
//!
//! ## Purpose
//! Fetches *all* pages of a filtered result set from the paged source using
//! a bounded concurrency limiter, exponential-backoff retry, and a single
//! cancellation token threaded through every suspension point. Raw records
//! are projected to `LeanRecord` as they arrive so memory stays bounded for
//! very large result sets.
//!
//! ## Input/Output Specification
//! - **Input**: Filter set, sort key, cancellation token, progress callback
//! - **Output**: The complete lean record set plus total/pages/timing
//! - **Failure**: All-or-nothing; a cancelled or failed aggregation never
//!   resolves with partial data
//!
//! ## Known Limitation
//! With a single-cursor keyset API, each page's cursor is only revealed once
//! the previous page completes, so the cursor chain is strictly sequential.
//! The fan-out limiter therefore only overlaps retry/backoff delays today;
//! real parallelism arrives with multi-cursor sources.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::AggregatorConfig;
use crate::errors::{EngineError, Result};
use crate::filters::FilterSet;
use crate::source::{PageResponse, PagedSource, RawRecord};
use crate::sorter::SortKey;
use crate::{AggregationProgress, LeanRecord};

/// Progress callback fired after every completed page
pub type ProgressCallback = Arc<dyn Fn(AggregationProgress) + Send + Sync>;

/// Result of a completed aggregation
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    /// Every record matching the filters, in page-arrival order
    pub records: Vec<LeanRecord>,
    /// Total count reported by the source
    pub total: usize,
    /// Pages fetched (including the first)
    pub pages_fetched: usize,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Fetches every page of a filtered result set
pub struct Aggregator {
    source: Arc<dyn PagedSource>,
    config: AggregatorConfig,
}

impl Aggregator {
    /// Create an aggregator over a paged source
    pub fn new(source: Arc<dyn PagedSource>, config: AggregatorConfig) -> Self {
        Self { source, config }
    }

    /// Fetch all pages for the given filters.
    ///
    /// The first page is fetched up front to learn the total and detect the
    /// pagination style; a source that reports no next cursor is single-page
    /// and returns immediately. Remaining pages flow through the fan-out
    /// limiter with per-page retry. Cancellation discards everything
    /// accumulated so far and surfaces `EngineError::Cancelled`.
    pub async fn fetch_all(
        &self,
        filters: &FilterSet,
        sort: &SortKey,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<AggregateOutcome> {
        let started = Instant::now();
        let limiter = Arc::new(Semaphore::new(self.config.fan_out));

        // 1. First page: learn total and pagination style
        let first = self
            .fetch_page_with_retry(filters, sort, None, &limiter, cancel)
            .await?;
        let total = first.total;
        let mut records: Vec<LeanRecord> = Vec::with_capacity(total);
        records.extend(first.items.iter().map(RawRecord::project));
        let mut pages_fetched = 1usize;
        let mut cursor = first.next_cursor;

        Self::emit(&progress, records.len(), total, pages_fetched);

        // 2. Cursor-chained pages through the limiter
        while let Some(current) = cursor.take() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if self.config.inter_page_delay_ms > 0 {
                cancellable_sleep(
                    Duration::from_millis(self.config.inter_page_delay_ms),
                    cancel,
                )
                .await?;
            }

            let page = self
                .fetch_page_with_retry(filters, sort, Some(&current), &limiter, cancel)
                .await?;
            records.extend(page.items.iter().map(RawRecord::project));
            pages_fetched += 1;
            cursor = page.next_cursor;

            Self::emit(&progress, records.len(), total, pages_fetched);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "aggregated {} records across {} pages from '{}' in {}ms",
            records.len(),
            pages_fetched,
            self.source.name(),
            duration_ms
        );

        Ok(AggregateOutcome {
            records,
            total,
            pages_fetched,
            duration_ms,
        })
    }

    fn emit(progress: &Option<ProgressCallback>, loaded: usize, total: usize, pages: usize) {
        if let Some(callback) = progress {
            callback(AggregationProgress::new(loaded, total, pages));
        }
    }

    /// Fetch one page under the limiter, retrying transient failures with
    /// exponential backoff. Cancellation and non-retryable client errors
    /// skip the retry loop entirely.
    async fn fetch_page_with_retry(
        &self,
        filters: &FilterSet,
        sort: &SortKey,
        cursor: Option<&str>,
        limiter: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<PageResponse> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = limiter.acquire() => permit.map_err(|_| EngineError::Internal {
                message: "fetch limiter closed".to_string(),
            })?,
        };

        let attempts = self.config.retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.retry_base_delay_ms);
        let delay_cap = Duration::from_millis(self.config.retry_max_delay_ms);

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.source.fetch_page(filters, sort, cursor, self.config.page_size) => result,
            };

            match result {
                Ok(page) => {
                    if attempt > 1 {
                        tracing::info!(
                            "page '{}' recovered on attempt {}",
                            cursor.unwrap_or("<first>"),
                            attempt
                        );
                    }
                    return Ok(page);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(
                        "non-retryable failure for page '{}': {}",
                        cursor.unwrap_or("<first>"),
                        err
                    );
                    return Err(EngineError::AggregationFailed {
                        attempts: attempt,
                        details: err.to_string(),
                    });
                }
                Err(err) => {
                    if attempt == attempts {
                        return Err(EngineError::AggregationFailed {
                            attempts,
                            details: err.to_string(),
                        });
                    }
                    tracing::warn!(
                        "transient failure for page '{}' (attempt {}/{}), retrying in {:?}: {}",
                        cursor.unwrap_or("<first>"),
                        attempt,
                        attempts,
                        delay,
                        err
                    );
                    cancellable_sleep(delay, cancel).await?;
                    delay = (delay * 2).min(delay_cap);
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }
}

/// Sleep that aborts promptly when the cancellation token fires
async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
