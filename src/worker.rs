//! # Sort Worker Module
//!
//! ## Purpose
//! Runs large sorts off the critical path. The coordinator hands a typed
//! request envelope (records, sort key, request id) to a dedicated blocking
//! task; the worker streams progress events back over a channel and returns
//! the fully merged result as a fresh allocation. No memory is shared
//! between the two sides beyond the channel.
//!
//! ## Input/Output Specification
//! - **Input**: `SortRequest { request_id, key, records }`
//! - **Output**: Progress events, then the ordered record set with timing
//! - **Deadline**: A hard timeout after which the sort is abandoned and
//!   `SortTimeout` is surfaced instead of hanging
//!
//! ## Key Features
//! - Chunked sort + repeated linear merge (see `sorter::chunked_sort`)
//! - Weighted progress (~80% chunk phase, ~20% merge phase)
//! - Cooperative cancellation checked between units of work

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SorterConfig;
use crate::errors::{EngineError, Result};
use crate::sorter::{chunked_sort, validate_sort_order, SortKey, SortOutcome};
use crate::LeanRecord;

/// Request envelope handed to the worker; ownership of the records moves
/// with it.
#[derive(Debug)]
pub struct SortRequest {
    pub request_id: Uuid,
    pub key: SortKey,
    pub records: Vec<LeanRecord>,
}

/// Progress event streamed back while a request is being processed
#[derive(Debug, Clone, Copy)]
pub struct SortProgress {
    pub request_id: Uuid,
    /// Overall completion in `[0, 1]`
    pub fraction: f32,
}

/// Callback invoked for every worker progress event
pub type SortProgressCallback = Arc<dyn Fn(SortProgress) + Send + Sync>;

/// Background sort executor; one per coordinator
pub struct SortWorker {
    chunk_size: usize,
    timeout: Duration,
}

impl SortWorker {
    pub fn new(config: &SorterConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            timeout: Duration::from_secs(config.sort_timeout_seconds),
        }
    }

    /// Sort a record set on the worker, forwarding progress to `progress`.
    ///
    /// Cancellation and the hard deadline both set a cooperative stop flag
    /// so the blocking task abandons the sort at the next chunk/merge
    /// boundary instead of running to completion on dead work.
    pub async fn sort(
        &self,
        records: Vec<LeanRecord>,
        key: SortKey,
        cancel: &CancellationToken,
        progress: Option<SortProgressCallback>,
    ) -> Result<SortOutcome> {
        let request = SortRequest {
            request_id: Uuid::new_v4(),
            key,
            records,
        };
        let request_id = request.request_id;
        let record_count = request.records.len();
        tracing::debug!(
            "sort request {} dispatched to worker ({} records, key {})",
            request_id,
            record_count,
            request.key
        );

        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker_flag = stop_flag.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SortProgress>();
        let chunk_size = self.chunk_size;
        let started = Instant::now();

        let mut handle = tokio::task::spawn_blocking(move || -> Result<Vec<LeanRecord>> {
            let key = request.key;
            chunked_sort(request.records, &key, chunk_size, &worker_flag, &move |fraction| {
                let _ = event_tx.send(SortProgress {
                    request_id,
                    fraction,
                });
            })
        });

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop_flag.store(true, Ordering::Relaxed);
                    tracing::debug!("sort request {} cancelled", request_id);
                    return Err(EngineError::Cancelled);
                }
                _ = &mut deadline => {
                    stop_flag.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        "sort request {} exceeded {}ms deadline, abandoning",
                        request_id,
                        self.timeout.as_millis()
                    );
                    return Err(EngineError::SortTimeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                event = event_rx.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            if let Some(callback) = progress.as_ref() {
                                callback(event);
                            }
                        }
                        // sender dropped; stop polling the channel
                        None => events_open = false,
                    }
                }
                joined = &mut handle => {
                    let records = match joined {
                        Ok(result) => result?,
                        Err(join_err) => {
                            return Err(EngineError::SortFailed {
                                details: format!("worker task failed: {}", join_err),
                            });
                        }
                    };
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug_assert!(validate_sort_order(&records, &key));
                    tracing::debug!(
                        "sort request {} completed: {} records in {}ms",
                        request_id,
                        records.len(),
                        duration_ms
                    );
                    return Ok(SortOutcome {
                        records,
                        duration_ms,
                    });
                }
            }
        }
    }
}
