//! # Auction Sort-and-Aggregate Engine
//!
//! ## Overview
//! This library implements the global sort-and-aggregate engine behind a
//! car-auction catalog: it pulls a complete filtered result set page-by-page
//! from a remote keyset-paginated API, produces a single globally-ordered
//! sequence for a chosen sort key, and caches the result across two tiers so
//! repeated navigation is instant.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `source`: Abstraction over the remote paginated listing API
//! - `aggregator`: Bounded-concurrency page fetching with retry and cancellation
//! - `sorter`: Total, stable ordering with background chunk + merge execution
//! - `cache`: Two-tier (memory LRU + durable) result cache
//! - `store`: Durable byte store backed by an embedded database
//! - `coordinator`: Public orchestration entry point and state machine
//! - `filters`: Canonical filter-set representation and cache-key derivation
//! - `config`: Configuration management and settings
//! - `errors`: Centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: Filter sets, sort keys, pages of raw listing records (JSON)
//! - **Output**: Globally sorted record sequences, page slices, diagnostics
//! - **Guarantees**: Deterministic total order across page boundaries,
//!   at-most-one pipeline in flight per coordinator, bounded memory
//!
//! ## Usage
//! ```rust,no_run
//! use auction_sort_engine::{Config, SortCoordinator, SortKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let coordinator = SortCoordinator::from_config(&config).await?;
//!     coordinator.on_sort_change("price:asc".parse::<SortKey>()?).await;
//!     let page = coordinator.get_page(1, 50).await;
//!     println!("{} of {} records", page.items.len(), page.total);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod filters;
pub mod source;
pub mod aggregator;
pub mod sorter;
pub mod worker;
pub mod cache;
pub mod store;
pub mod coordinator;

// Utilities
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use coordinator::{EngineState, PageView, SortCoordinator};
pub use errors::{EngineError, Result};
pub use filters::{FilterSet, FilterValue};
pub use sorter::{SortDirection, SortField, SortKey};

use serde::{Deserialize, Serialize};

/// The unit that is aggregated, sorted, and cached.
///
/// A lossy projection of a raw listing record down to the six sort/display
/// fields plus the stable `id`. Numeric fields are `None` when the upstream
/// value was absent or unparseable; they are never silently coerced to zero,
/// so the missing-last ordering rule stays observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeanRecord {
    /// Stable unique key, used as the ordering tie-breaker
    pub id: String,
    /// Asking price in the catalog's base currency
    pub price: Option<f64>,
    /// Model year
    pub year: Option<i32>,
    /// Odometer reading
    pub mileage: Option<f64>,
    /// Manufacturer name
    pub make: String,
    /// Model name
    pub model: String,
    /// Thumbnail image URL
    pub thumbnail: Option<String>,
}

/// Progress snapshot pushed to the aggregation progress callback.
///
/// Transient value; fired after every completed page with a monotonically
/// increasing `loaded` count. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationProgress {
    /// Records accumulated so far
    pub loaded: usize,
    /// Total records reported by the source
    pub total: usize,
    /// Pages completed so far
    pub pages_fetched: usize,
    /// Records still outstanding (`max(0, total - loaded)`)
    pub remaining: usize,
}

impl AggregationProgress {
    pub fn new(loaded: usize, total: usize, pages_fetched: usize) -> Self {
        Self {
            loaded,
            total,
            pages_fetched,
            remaining: total.saturating_sub(loaded),
        }
    }
}
