//! # Sort Coordinator Module
//!
//! ## Purpose
//! Public entry point and state machine for the engine. A sort-key change
//! flows cache-first: a cached result short-circuits straight to `Ready`;
//! otherwise the coordinator aggregates (only when no memoized record set
//! exists for the current filters), sorts (synchronously or on the
//! background worker by size), writes the result to the cache, and exposes
//! page slicing over the resident sorted array.
//!
//! ## Input/Output Specification
//! - **Input**: Sort-key changes, filter changes, page requests
//! - **Output**: State snapshots, page views, diagnostics
//! - **States**: `Idle → Aggregating → Sorting → Ready`, `Error` reachable
//!   from any in-flight state; `Idle`/`Ready` are the only rest states
//!
//! ## Key Features
//! - At most one aggregate/sort pipeline in flight; a new sort-key change
//!   cancels the previous one (last-write-wins)
//! - Resort without refetch via a per-filter-signature aggregate memo
//! - Errors reported through the state snapshot, never thrown across the
//!   public API; previously-ready data survives a failed refresh
//! - Cancellation is a silent transition back to the preceding rest state

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::cache::{CacheEntry, CacheManager, CacheStats};
use crate::config::Config;
use crate::errors::Result;
use crate::filters::FilterSet;
use crate::sorter::{sort_records, SortKey};
use crate::source::{HttpPagedSource, PagedSource};
use crate::store::SledStore;
use crate::worker::{SortProgressCallback, SortWorker};
use crate::{AggregationProgress, LeanRecord};

/// Coordinator lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Aggregating,
    Sorting,
    Ready,
    Error,
}

/// One page of the sorted result set
#[derive(Debug, Clone, Serialize)]
pub struct PageView {
    pub items: Vec<LeanRecord>,
    pub total: usize,
    pub total_pages: usize,
    pub current_page: usize,
    pub has_prev: bool,
    pub has_next: bool,
}

/// Point-in-time view of the coordinator, safe to hand to a UI
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub error: Option<String>,
    pub current_sort: Option<SortKey>,
    pub record_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub aggregation_progress: Option<AggregationProgress>,
    pub sort_progress: Option<f32>,
}

/// Engine diagnostics exposed to callers
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub cache: CacheStats,
    pub last_fetch_duration_ms: Option<u64>,
    pub last_sort_duration_ms: Option<u64>,
    /// Average sort duration per sort-key signature
    pub avg_sort_duration_ms: HashMap<String, u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Memoized aggregate for the resort-without-refetch optimization
struct AggregateMemo {
    signature: String,
    records: Arc<Vec<LeanRecord>>,
    total: usize,
    aggregated_at: DateTime<Utc>,
}

/// Mutable coordinator state behind the RwLock
struct CoordinatorState {
    state: EngineState,
    error: Option<String>,
    filters: FilterSet,
    current_sort: Option<SortKey>,
    /// Resident sorted array; replaced on every successful sort, never
    /// mutated in place
    sorted: Arc<Vec<LeanRecord>>,
    memo: Option<AggregateMemo>,
    last_fetch_duration_ms: Option<u64>,
    last_sort_duration_ms: Option<u64>,
    last_updated: Option<DateTime<Utc>>,
}

impl CoordinatorState {
    fn rest_state(&self) -> EngineState {
        if self.last_updated.is_some() {
            EngineState::Ready
        } else {
            EngineState::Idle
        }
    }
}

/// In-flight progress shared with sync callbacks
#[derive(Default)]
struct InflightProgress {
    aggregation: Option<AggregationProgress>,
    sort_fraction: Option<f32>,
}

struct DurationStat {
    total_ms: u64,
    samples: u64,
}

/// Orchestrates aggregation, sorting, caching, and paging
pub struct SortCoordinator {
    aggregator: Aggregator,
    cache: Arc<CacheManager>,
    worker: SortWorker,
    worker_threshold: usize,
    memo_ttl_seconds: u64,
    state: RwLock<CoordinatorState>,
    active: parking_lot::Mutex<CancellationToken>,
    progress: Arc<parking_lot::Mutex<InflightProgress>>,
    sort_durations: DashMap<String, DurationStat>,
}

impl SortCoordinator {
    /// Assemble a coordinator from explicit collaborators
    pub fn new(source: Arc<dyn PagedSource>, cache: Arc<CacheManager>, config: &Config) -> Self {
        Self {
            aggregator: Aggregator::new(source, config.aggregator.clone()),
            cache,
            worker: SortWorker::new(&config.sorter),
            worker_threshold: config.sorter.worker_threshold,
            memo_ttl_seconds: config.cache.memo_ttl_seconds,
            state: RwLock::new(CoordinatorState {
                state: EngineState::Idle,
                error: None,
                filters: FilterSet::new(),
                current_sort: None,
                sorted: Arc::new(Vec::new()),
                memo: None,
                last_fetch_duration_ms: None,
                last_sort_duration_ms: None,
                last_updated: None,
            }),
            active: parking_lot::Mutex::new(CancellationToken::new()),
            progress: Arc::new(parking_lot::Mutex::new(InflightProgress::default())),
            sort_durations: DashMap::new(),
        }
    }

    /// Build the production wiring from configuration: HTTP source, sled
    /// store, two-tier cache, optional startup sweep.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let source: Arc<dyn PagedSource> = Arc::new(HttpPagedSource::new(
            config.source.base_url.clone(),
            config.source.api_key.clone(),
            config.request_timeout(),
        )?);

        let cache = match SledStore::open(&config.cache.durable_path).await {
            Ok(store) => Arc::new(CacheManager::new(&config.cache, Some(Arc::new(store)))),
            Err(err) => {
                tracing::warn!("durable store unavailable, running memory-only: {}", err);
                Arc::new(CacheManager::new(&config.cache, None))
            }
        };
        if config.cache.sweep_on_startup {
            if let Err(err) = cache.sweep_durable().await {
                tracing::warn!("startup sweep failed: {}", err);
            }
        }

        Ok(Self::new(source, cache, config))
    }

    /// Replace the active filter set.
    ///
    /// A signature change invalidates nothing eagerly; the aggregate memo
    /// simply stops matching and the next sort-key change refetches.
    pub async fn set_filters(&self, filters: FilterSet) {
        let mut state = self.state.write().await;
        state.filters = filters;
    }

    /// Handle a sort-key change; the public entry point.
    ///
    /// Never returns an error: failures are reported through the snapshot so
    /// callers always observe a consistent state.
    pub async fn on_sort_change(&self, key: SortKey) -> EngineSnapshot {
        // 1. Cancel the previous pipeline (last-write-wins)
        let cancel = {
            let mut active = self.active.lock();
            active.cancel();
            let fresh = CancellationToken::new();
            *active = fresh.clone();
            fresh
        };

        let filters = {
            let state = self.state.read().await;
            state.filters.clone()
        };

        // 2. Cache-first short-circuit: no fetch, no sort
        if let Some(entry) = self.cache.get(&filters, &key).await {
            tracing::info!("cache hit for {}, serving {} records", key, entry.records.len());
            if cancel.is_cancelled() {
                return self.snapshot().await;
            }
            let mut state = self.state.write().await;
            state.sorted = Arc::new(entry.records);
            state.current_sort = Some(key);
            state.state = EngineState::Ready;
            state.error = None;
            state.last_updated = Some(Utc::now());
            drop(state);
            self.clear_progress();
            return self.snapshot().await;
        }

        // 3. Aggregate, unless a live memo covers the current filters
        let signature = filters.signature();
        let memoized = self.take_memo(&signature).await;
        let (records, total) = match memoized {
            Some((records, total)) => {
                tracing::debug!("reusing memoized aggregate for resort ({} records)", records.len());
                (records, total)
            }
            None => {
                if !self.transition_inflight(&cancel, EngineState::Aggregating).await {
                    return self.snapshot().await;
                }
                let progress = self.progress.clone();
                let callback: crate::aggregator::ProgressCallback = Arc::new(move |update| {
                    progress.lock().aggregation = Some(update);
                });

                match self
                    .aggregator
                    .fetch_all(&filters, &key, &cancel, Some(callback))
                    .await
                {
                    Ok(outcome) => {
                        let records = Arc::new(outcome.records);
                        let mut state = self.state.write().await;
                        state.last_fetch_duration_ms = Some(outcome.duration_ms);
                        state.memo = Some(AggregateMemo {
                            signature: signature.clone(),
                            records: records.clone(),
                            total: outcome.total,
                            aggregated_at: Utc::now(),
                        });
                        drop(state);
                        (records, outcome.total)
                    }
                    Err(err) if err.is_cancelled() => {
                        self.settle_after_cancel();
                        return self.snapshot().await;
                    }
                    Err(err) => {
                        self.enter_error(err.to_string(), &cancel).await;
                        return self.snapshot().await;
                    }
                }
            }
        };

        // 4. Sort: synchronous below the threshold, worker at or above it
        if !self.transition_inflight(&cancel, EngineState::Sorting).await {
            return self.snapshot().await;
        }
        let input: Vec<LeanRecord> = records.as_ref().clone();
        let sort_result = if input.len() >= self.worker_threshold {
            let progress = self.progress.clone();
            let callback: SortProgressCallback = Arc::new(move |update| {
                progress.lock().sort_fraction = Some(update.fraction);
            });
            self.worker.sort(input, key, &cancel, Some(callback)).await
        } else {
            Ok(sort_records(input, &key))
        };

        let outcome = match sort_result {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => {
                self.settle_after_cancel();
                return self.snapshot().await;
            }
            Err(err) => {
                self.enter_error(err.to_string(), &cancel).await;
                return self.snapshot().await;
            }
        };

        // A supersede that raced the final merge must not publish or cache
        if cancel.is_cancelled() {
            return self.snapshot().await;
        }

        // 5. Cache the result and go ready
        let entry = CacheEntry::new(filters, key, outcome.records.clone(), total);
        if let Err(err) = self.cache.put(entry).await {
            tracing::warn!("cache write failed: {}", err);
        }

        self.record_sort_duration(&key, outcome.duration_ms);
        {
            let mut state = self.state.write().await;
            if cancel.is_cancelled() {
                // cancelled while caching; whoever cancelled owns the state
                return self.snapshot().await;
            }
            state.sorted = Arc::new(outcome.records);
            state.current_sort = Some(key);
            state.last_sort_duration_ms = Some(outcome.duration_ms);
            state.last_updated = Some(Utc::now());
            state.state = EngineState::Ready;
            state.error = None;
        }
        self.clear_progress();

        self.snapshot().await
    }

    /// Move to an in-flight state, but only while this pipeline still owns
    /// the active token. The check runs under the state lock so a cancel
    /// and a transition cannot interleave.
    async fn transition_inflight(&self, cancel: &CancellationToken, next: EngineState) -> bool {
        let mut state = self.state.write().await;
        if cancel.is_cancelled() {
            return false;
        }
        state.state = next;
        state.error = None;
        true
    }

    /// Abort any in-flight aggregation or sort and settle back to the
    /// preceding rest state. A no-op when nothing is in flight.
    pub async fn cancel_inflight(&self) {
        let mut state = self.state.write().await;
        // cancel under the state lock so no in-flight transition can land
        // between the cancel and the restore below
        self.active.lock().cancel();
        if matches!(state.state, EngineState::Aggregating | EngineState::Sorting) {
            state.state = state.rest_state();
        }
        drop(state);
        self.clear_progress();
    }

    /// Pure slice over the resident sorted array; never triggers I/O.
    ///
    /// The page number is clamped into `[1, total_pages]`.
    pub async fn get_page(&self, page: usize, page_size: usize) -> PageView {
        let state = self.state.read().await;
        let total = state.sorted.len();
        let page_size = page_size.max(1);
        let total_pages = (total + page_size - 1) / page_size;
        let current_page = page.clamp(1, total_pages.max(1));

        let start = (current_page - 1) * page_size;
        let end = (start + page_size).min(total);
        let items = if start < total {
            state.sorted[start..end].to_vec()
        } else {
            Vec::new()
        };

        PageView {
            items,
            total,
            total_pages,
            current_page,
            has_prev: current_page > 1,
            has_next: current_page < total_pages,
        }
    }

    /// True when a sorted result set is resident and current
    pub async fn is_ready(&self) -> bool {
        self.state.read().await.state == EngineState::Ready
    }

    /// Current coordinator state
    pub async fn state(&self) -> EngineState {
        self.state.read().await.state
    }

    /// Point-in-time snapshot for UIs
    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.read().await;
        let progress = self.progress.lock();
        EngineSnapshot {
            state: state.state,
            error: state.error.clone(),
            current_sort: state.current_sort,
            record_count: state.sorted.len(),
            last_updated: state.last_updated,
            aggregation_progress: progress.aggregation.clone(),
            sort_progress: progress.sort_fraction,
        }
    }

    /// Drop both cache tiers
    pub async fn clear_cache(&self) -> Result<()> {
        self.cache.clear().await
    }

    /// Engine diagnostics: cache counters, durations, per-key averages
    pub async fn diagnostics(&self) -> Diagnostics {
        let state = self.state.read().await;
        let avg_sort_duration_ms = self
            .sort_durations
            .iter()
            .map(|item| {
                let stat = item.value();
                (item.key().clone(), stat.total_ms / stat.samples.max(1))
            })
            .collect();
        Diagnostics {
            cache: self.cache.stats(),
            last_fetch_duration_ms: state.last_fetch_duration_ms,
            last_sort_duration_ms: state.last_sort_duration_ms,
            avg_sort_duration_ms,
            last_updated: state.last_updated,
        }
    }

    /// Fetch the memoized aggregate when it covers `signature` and has not
    /// outlived the optional memo TTL.
    async fn take_memo(&self, signature: &str) -> Option<(Arc<Vec<LeanRecord>>, usize)> {
        let state = self.state.read().await;
        let memo = state.memo.as_ref()?;
        if memo.signature != signature {
            return None;
        }
        if self.memo_ttl_seconds > 0 {
            let age = Utc::now()
                .signed_duration_since(memo.aggregated_at)
                .num_seconds();
            if age >= self.memo_ttl_seconds as i64 {
                tracing::debug!("aggregate memo outlived its TTL, refetching");
                return None;
            }
        }
        Some((memo.records.clone(), memo.total))
    }

    /// Silent settle after a cancellation. The canceller (a superseding
    /// sort change or `cancel_inflight`) owns the state transition, so the
    /// abandoned pipeline just walks away without touching state.
    fn settle_after_cancel(&self) {
        tracing::debug!("pipeline abandoned after cancellation");
    }

    /// Enter the error state, preserving previously-ready data
    async fn enter_error(&self, message: String, cancel: &CancellationToken) {
        let mut state = self.state.write().await;
        if cancel.is_cancelled() {
            // superseded mid-failure; the newer pipeline owns the state now
            return;
        }
        tracing::error!("pipeline failed: {}", message);
        state.state = EngineState::Error;
        state.error = Some(message);
        drop(state);
        self.clear_progress();
    }

    fn clear_progress(&self) {
        *self.progress.lock() = InflightProgress::default();
    }

    fn record_sort_duration(&self, key: &SortKey, duration_ms: u64) {
        let mut stat = self
            .sort_durations
            .entry(key.signature())
            .or_insert(DurationStat {
                total_ms: 0,
                samples: 0,
            });
        stat.total_ms += duration_ms;
        stat.samples += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sorter::test_support::synthetic_records;
    use crate::sorter::{SortDirection, SortField};
    use crate::source::testing::{InMemorySource, FIRST_PAGE};
    use crate::FilterValue;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.aggregator.page_size = 100;
        config.aggregator.retry_base_delay_ms = 1;
        config.aggregator.retry_max_delay_ms = 4;
        config.aggregator.inter_page_delay_ms = 0;
        config
    }

    fn build(records: Vec<LeanRecord>) -> (Arc<InMemorySource>, Arc<CacheManager>, SortCoordinator) {
        build_with(records, test_config(), Duration::ZERO)
    }

    fn build_with(
        records: Vec<LeanRecord>,
        config: Config,
        page_delay: Duration,
    ) -> (Arc<InMemorySource>, Arc<CacheManager>, SortCoordinator) {
        let source = Arc::new(InMemorySource::new(records).with_page_delay(page_delay));
        let cache = Arc::new(CacheManager::new(&config.cache, None));
        let coordinator = SortCoordinator::new(source.clone(), cache.clone(), &config);
        (source, cache, coordinator)
    }

    fn price_asc() -> SortKey {
        SortKey::new(SortField::Price, SortDirection::Asc)
    }

    fn year_desc() -> SortKey {
        SortKey::new(SortField::Year, SortDirection::Desc)
    }

    /// 1,183 records with distinct prices, so the global minimum and maximum
    /// are unique and rank checks are exact.
    fn distinct_price_records() -> Vec<LeanRecord> {
        (0..1_183usize)
            .map(|i| LeanRecord {
                id: format!("lot-{:04}", i),
                price: Some(((i * 7_919) % 100_000) as f64),
                year: Some(2000 + (i % 25) as i32),
                mileage: Some((i * 137 % 250_000) as f64),
                make: "Make".to_string(),
                model: "Model".to_string(),
                thumbnail: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sort_change_reaches_ready() {
        let (_, _, coordinator) = build(synthetic_records(250, 71));
        let snapshot = coordinator.on_sort_change(price_asc()).await;

        assert_eq!(snapshot.state, EngineState::Ready);
        assert_eq!(snapshot.record_count, 250);
        assert_eq!(snapshot.current_sort, Some(price_asc()));
        assert!(snapshot.error.is_none());
        assert!(coordinator.is_ready().await);
    }

    #[tokio::test]
    async fn test_cross_page_ordering_scenario() {
        let records = distinct_price_records();
        let baseline = crate::sorter::sort_records(records.clone(), &price_asc()).records;
        let (_, _, coordinator) = build(records);

        coordinator.on_sort_change(price_asc()).await;

        let first = coordinator.get_page(1, 50).await;
        assert_eq!(first.total, 1_183);
        assert_eq!(first.total_pages, 24);
        assert!(!first.has_prev);
        assert!(first.has_next);

        let last = coordinator.get_page(24, 50).await;
        assert_eq!(last.items.len(), 33);
        assert!(last.has_prev);
        assert!(!last.has_next);

        // the unique global minimum sits on page 1, the maximum on page 24
        assert_eq!(first.items[0].price, baseline[0].price);
        assert_eq!(last.items.last().unwrap().price, baseline.last().unwrap().price);

        // page boundaries are monotone and every rank matches the baseline
        let mut concatenated = Vec::new();
        let mut previous_max: Option<f64> = None;
        for page in 1..=24 {
            let view = coordinator.get_page(page, 50).await;
            if let (Some(prev), Some(first_item)) = (previous_max, view.items.first()) {
                assert!(prev <= first_item.price.unwrap());
            }
            previous_max = view.items.last().and_then(|r| r.price);
            concatenated.extend(view.items);
        }
        assert_eq!(concatenated, baseline);
    }

    #[tokio::test]
    async fn test_pagination_covers_every_record_exactly_once() {
        let (_, _, coordinator) = build(synthetic_records(257, 73));
        coordinator.on_sort_change(year_desc()).await;

        let mut seen = Vec::new();
        let view = coordinator.get_page(1, 40).await;
        let total_pages = view.total_pages;
        for page in 1..=total_pages {
            seen.extend(coordinator.get_page(page, 40).await.items);
        }

        assert_eq!(seen.len(), 257);
        let mut ids: Vec<String> = seen.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 257);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch_and_sort() {
        let (source, _, coordinator) = build(synthetic_records(250, 79));
        coordinator.on_sort_change(price_asc()).await;
        let calls_after_first = source.total_calls();

        let snapshot = coordinator.on_sort_change(price_asc()).await;
        assert_eq!(snapshot.state, EngineState::Ready);
        assert_eq!(source.total_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_resort_reuses_aggregated_records_without_refetch() {
        let (source, _, coordinator) = build(synthetic_records(250, 83));
        coordinator.on_sort_change(price_asc()).await;
        let calls_after_first = source.total_calls();

        let snapshot = coordinator.on_sort_change(year_desc()).await;
        assert_eq!(snapshot.state, EngineState::Ready);
        assert_eq!(snapshot.current_sort, Some(year_desc()));
        // cache miss for the new key, but the aggregate memo spares the fetch
        assert_eq!(source.total_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_filter_change_forces_refetch() {
        let (source, _, coordinator) = build(synthetic_records(250, 89));
        coordinator.on_sort_change(price_asc()).await;
        let calls_after_first = source.total_calls();

        let mut filters = FilterSet::new();
        filters.set("make", FilterValue::List(vec!["Audi".to_string()]));
        coordinator.set_filters(filters).await;
        coordinator.on_sort_change(price_asc()).await;

        assert!(source.total_calls() > calls_after_first);
    }

    #[tokio::test]
    async fn test_cancel_inflight_discards_everything() {
        let (_, cache, coordinator) = build_with(
            synthetic_records(1_000, 97),
            test_config(),
            Duration::from_millis(20),
        );
        let coordinator = Arc::new(coordinator);

        let runner = coordinator.clone();
        let task = tokio::spawn(async move { runner.on_sort_change(price_asc()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.cancel_inflight().await;
        task.await.unwrap();

        // nothing was published or cached; with no prior data we rest at idle
        assert_eq!(coordinator.state().await, EngineState::Idle);
        assert_eq!(coordinator.snapshot().await.record_count, 0);
        assert!(cache.get(&FilterSet::new(), &price_asc()).await.is_none());
    }

    #[tokio::test]
    async fn test_new_sort_change_supersedes_inflight_one() {
        let (_, _, coordinator) = build_with(
            synthetic_records(600, 101),
            test_config(),
            Duration::from_millis(15),
        );
        let coordinator = Arc::new(coordinator);

        let runner = coordinator.clone();
        let superseded = tokio::spawn(async move { runner.on_sort_change(price_asc()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = coordinator.on_sort_change(year_desc()).await;
        superseded.await.unwrap();

        assert_eq!(snapshot.state, EngineState::Ready);
        assert_eq!(snapshot.current_sort, Some(year_desc()));
        assert_eq!(coordinator.state().await, EngineState::Ready);
    }

    #[tokio::test]
    async fn test_failed_refresh_preserves_previous_results() {
        let (source, _, coordinator) = build(synthetic_records(250, 103));
        coordinator.on_sort_change(price_asc()).await;
        assert!(coordinator.is_ready().await);

        // new filters force a refetch, which now fails outright
        let mut filters = FilterSet::new();
        filters.set("year", FilterValue::Range { min: Some(2020.0), max: None });
        coordinator.set_filters(filters).await;
        source.fail_page(FIRST_PAGE, u32::MAX);

        let snapshot = coordinator.on_sort_change(price_asc()).await;
        assert_eq!(snapshot.state, EngineState::Error);
        assert!(snapshot.error.is_some());
        // stale-but-valid data keeps serving pages
        assert_eq!(snapshot.record_count, 250);
        assert_eq!(coordinator.get_page(1, 50).await.items.len(), 50);
    }

    #[tokio::test]
    async fn test_get_page_clamps_out_of_range_pages() {
        let (_, _, coordinator) = build(synthetic_records(120, 107));
        coordinator.on_sort_change(price_asc()).await;

        let below = coordinator.get_page(0, 50).await;
        assert_eq!(below.current_page, 1);

        let above = coordinator.get_page(99, 50).await;
        assert_eq!(above.current_page, 3);
        assert_eq!(above.items.len(), 20);
        assert!(!above.has_next);
    }

    #[tokio::test]
    async fn test_empty_result_set_is_ready_with_empty_pages() {
        let (_, _, coordinator) = build(Vec::new());
        let snapshot = coordinator.on_sort_change(price_asc()).await;

        assert_eq!(snapshot.state, EngineState::Ready);
        assert_eq!(snapshot.record_count, 0);

        let view = coordinator.get_page(1, 50).await;
        assert!(view.items.is_empty());
        assert_eq!(view.total_pages, 0);
        assert_eq!(view.current_page, 1);
        assert!(!view.has_prev && !view.has_next);
    }

    #[tokio::test]
    async fn test_diagnostics_track_durations_and_cache_counters() {
        let (_, _, coordinator) = build(synthetic_records(250, 109));
        coordinator.on_sort_change(price_asc()).await;
        coordinator.on_sort_change(price_asc()).await;

        let diagnostics = coordinator.diagnostics().await;
        assert!(diagnostics.last_fetch_duration_ms.is_some());
        assert!(diagnostics.last_sort_duration_ms.is_some());
        assert!(diagnostics
            .avg_sort_duration_ms
            .contains_key(&price_asc().signature()));
        assert_eq!(diagnostics.cache.memory_hits, 1);
        assert!(diagnostics.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_large_input_takes_worker_path() {
        let mut config = test_config();
        config.sorter.worker_threshold = 1_000;
        config.sorter.chunk_size = 500;
        config.aggregator.page_size = 2_000;
        let (_, _, coordinator) = build_with(synthetic_records(6_000, 113), config, Duration::ZERO);

        let snapshot = coordinator.on_sort_change(price_asc()).await;
        assert_eq!(snapshot.state, EngineState::Ready);

        let page = coordinator.get_page(1, 100).await;
        // worker output must satisfy the same total-order property
        let mut previous: Option<LeanRecord> = None;
        for page_number in 1..=page.total_pages {
            for record in coordinator.get_page(page_number, 100).await.items {
                if let Some(prev) = previous.as_ref() {
                    assert_ne!(
                        crate::sorter::compare_records(prev, &record, &price_asc()),
                        std::cmp::Ordering::Greater
                    );
                }
                previous = Some(record);
            }
        }
    }
}
