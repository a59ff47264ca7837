//! # Sorter Module
//!
//! ## Purpose
//! Produces a single, globally-ordered sequence for a chosen sort key out of
//! the complete aggregated record set. The order is total and stable: missing
//! values always sort to the end regardless of direction, and ties (including
//! both-missing ties) break on `id` ascending, so repeated sorts of identical
//! input are byte-identical.
//!
//! ## Input/Output Specification
//! - **Input**: Complete `LeanRecord` set, a `SortKey`
//! - **Output**: Fully ordered record sequence plus timing
//! - **Strategy**: Single-pass sort below the worker threshold; chunked sort
//!   with a repeated linear merge above it (see `worker`)
//!
//! ## Key Features
//! - Explicit missing-value placement (always last, both directions)
//! - Collation-key comparison for make/model (NFKD + case folding)
//! - Deterministic `id` tie-break independent of the requested direction
//! - Pure `validate_sort_order` check for assertions and tests

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::time::Instant;

use rayon::prelude::*;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::errors::{EngineError, Result};
use crate::LeanRecord;

/// Sortable record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Price,
    Year,
    Mileage,
    Make,
    Model,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A (field, direction) pair identifying one total ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortField {
    fn as_str(&self) -> &'static str {
        match self {
            SortField::Price => "price",
            SortField::Year => "year",
            SortField::Mileage => "mileage",
            SortField::Make => "make",
            SortField::Model => "model",
        }
    }

    /// All sortable fields, for exhaustive property checks
    pub fn all() -> [SortField; 5] {
        [
            SortField::Price,
            SortField::Year,
            SortField::Mileage,
            SortField::Make,
            SortField::Model,
        ]
    }
}

impl SortDirection {
    fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

impl SortKey {
    pub fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Stable string signature used in cache keys and diagnostics
    pub fn signature(&self) -> String {
        format!("{}:{}", self.field.as_str(), self.direction.as_str())
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field.as_str(), self.direction.as_str())
    }
}

impl FromStr for SortKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (field, direction) = s.split_once(':').ok_or_else(|| EngineError::Config {
            message: format!("invalid sort key '{}', expected '<field>:<asc|desc>'", s),
        })?;
        let field = match field {
            "price" => SortField::Price,
            "year" => SortField::Year,
            "mileage" => SortField::Mileage,
            "make" => SortField::Make,
            "model" => SortField::Model,
            other => {
                return Err(EngineError::Config {
                    message: format!("unknown sort field '{}'", other),
                })
            }
        };
        let direction = match direction {
            "asc" => SortDirection::Asc,
            "desc" => SortDirection::Desc,
            other => {
                return Err(EngineError::Config {
                    message: format!("unknown sort direction '{}'", other),
                })
            }
        };
        Ok(SortKey::new(field, direction))
    }
}

/// Result of a completed sort
#[derive(Debug, Clone)]
pub struct SortOutcome {
    /// The fully ordered record sequence
    pub records: Vec<LeanRecord>,
    /// Wall-clock sort duration in milliseconds
    pub duration_ms: u64,
}

/// Collation key for make/model comparison: NFKD-normalized with combining
/// marks stripped, then case-folded, so "Škoda" and "SKODA" order next to
/// each other.
fn collation_key(s: &str) -> String {
    s.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Compare two optional numeric values under a direction.
///
/// Missing values sort last in both directions; present values compare
/// numerically, with the direction flipping only the present-vs-present case.
fn compare_numeric(a: Option<f64>, b: Option<f64>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ordering = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        }
    }
}

fn compare_text(a: &str, b: &str, direction: SortDirection) -> Ordering {
    let ordering = collation_key(a).cmp(&collation_key(b));
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Total-order comparator for a sort key.
///
/// Primary comparison on the named field, then `id` ascending whenever the
/// primary comparison is equal; the tie-break never flips with direction.
pub fn compare_records(a: &LeanRecord, b: &LeanRecord, key: &SortKey) -> Ordering {
    let primary = match key.field {
        SortField::Price => compare_numeric(a.price, b.price, key.direction),
        SortField::Year => compare_numeric(
            a.year.map(f64::from),
            b.year.map(f64::from),
            key.direction,
        ),
        SortField::Mileage => compare_numeric(a.mileage, b.mileage, key.direction),
        SortField::Make => compare_text(&a.make, &b.make, key.direction),
        SortField::Model => compare_text(&a.model, &b.model, key.direction),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

/// Sort the complete record set on the calling thread.
///
/// This is the baseline single-pass strategy used below the worker threshold;
/// the chunked worker path must produce an order identical to this one.
pub fn sort_records(mut records: Vec<LeanRecord>, key: &SortKey) -> SortOutcome {
    let started = Instant::now();
    records.sort_by(|a, b| compare_records(a, b, key));
    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::debug!(
        "sorted {} records by {} in {}ms",
        records.len(),
        key,
        duration_ms
    );
    SortOutcome {
        records,
        duration_ms,
    }
}

/// Pure check that a sequence is non-decreasing under the key's comparator.
///
/// No side effects; used as an internal assertion and exposed for tests.
pub fn validate_sort_order(records: &[LeanRecord], key: &SortKey) -> bool {
    records
        .windows(2)
        .all(|pair| compare_records(&pair[0], &pair[1], key) != Ordering::Greater)
}

/// Weight of the chunk-sort phase in overall progress; the merge phase
/// accounts for the remainder.
const CHUNK_PHASE_WEIGHT: f32 = 0.8;

/// Chunked sort + repeated linear merge, for inputs above the worker
/// threshold.
///
/// The input is split into fixed-size chunks, each sorted independently with
/// the same comparator (chunks sort in parallel), then merged pairwise across
/// the chunk list on a single thread. Progress is reported as a fraction in
/// `[0, 1]`, weighted ~80% chunk sorting / ~20% merging. The `cancel` flag is
/// checked between units of work so an abandoned sort stops early.
pub fn chunked_sort(
    records: Vec<LeanRecord>,
    key: &SortKey,
    chunk_size: usize,
    cancel: &AtomicBool,
    progress: &(dyn Fn(f32) + Sync),
) -> Result<Vec<LeanRecord>> {
    let chunk_size = chunk_size.max(1);
    if records.len() <= chunk_size {
        let outcome = sort_records(records, key);
        progress(1.0);
        return Ok(outcome.records);
    }

    let mut chunks: Vec<Vec<LeanRecord>> = Vec::new();
    let mut remaining = records;
    while remaining.len() > chunk_size {
        let tail = remaining.split_off(chunk_size);
        chunks.push(std::mem::replace(&mut remaining, tail));
    }
    chunks.push(remaining);

    let chunk_count = chunks.len();
    let completed = AtomicUsize::new(0);

    // 1. Sort chunks independently (parallel; same comparator as baseline)
    chunks.par_iter_mut().try_for_each(|chunk| {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        chunk.sort_by(|a, b| compare_records(a, b, key));
        let done = completed.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        progress(CHUNK_PHASE_WEIGHT * done as f32 / chunk_count as f32);
        Ok(())
    })?;

    // 2. Repeated linear merge across the chunk list (single-threaded)
    let merge_total = (chunk_count - 1) as f32;
    let mut iter = chunks.into_iter();
    let mut merged = iter.next().unwrap_or_default();
    for (i, chunk) in iter.enumerate() {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        merged = merge_two(merged, chunk, key);
        progress(CHUNK_PHASE_WEIGHT + (1.0 - CHUNK_PHASE_WEIGHT) * (i + 1) as f32 / merge_total);
    }

    debug_assert!(validate_sort_order(&merged, key));
    Ok(merged)
}

/// Linear merge of two sorted runs, preserving the comparator's tie-break.
///
/// Equal elements take the left run first, matching the stability of the
/// single-pass sort.
fn merge_two(left: Vec<LeanRecord>, right: Vec<LeanRecord>, key: &SortKey) -> Vec<LeanRecord> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left_iter = left.into_iter().peekable();
    let mut right_iter = right.into_iter().peekable();

    loop {
        match (left_iter.peek(), right_iter.peek()) {
            (Some(l), Some(r)) => {
                if compare_records(l, r, key) != Ordering::Greater {
                    out.push(left_iter.next().unwrap());
                } else {
                    out.push(right_iter.next().unwrap());
                }
            }
            (Some(_), None) => {
                out.extend(left_iter);
                break;
            }
            (None, _) => {
                out.extend(right_iter);
                break;
            }
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::LeanRecord;

    /// Deterministic xorshift generator so property tests are reproducible
    pub struct XorShift64 {
        state: u64,
    }

    impl XorShift64 {
        pub fn new(seed: u64) -> Self {
            Self {
                state: seed.max(1),
            }
        }

        pub fn next_u64(&mut self) -> u64 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.state = x;
            x
        }

        pub fn next_in(&mut self, bound: u64) -> u64 {
            self.next_u64() % bound
        }
    }

    const MAKES: &[&str] = &["Audi", "BMW", "Citroën", "dacia", "Škoda", "Volvo"];
    const MODELS: &[&str] = &["A4", "X5", "C3", "Duster", "Octavia", "V60"];

    /// Generate `count` synthetic records; roughly one in eight has a missing
    /// numeric field so the null-placement rules are exercised.
    pub fn synthetic_records(count: usize, seed: u64) -> Vec<LeanRecord> {
        let mut rng = XorShift64::new(seed);
        (0..count)
            .map(|i| {
                let missing = rng.next_in(8) == 0;
                LeanRecord {
                    id: format!("lot-{:06}", i),
                    price: if missing {
                        None
                    } else {
                        Some(rng.next_in(200_000) as f64)
                    },
                    year: if rng.next_in(8) == 0 {
                        None
                    } else {
                        Some(1990 + rng.next_in(35) as i32)
                    },
                    mileage: if rng.next_in(8) == 0 {
                        None
                    } else {
                        Some(rng.next_in(300_000) as f64)
                    },
                    make: MAKES[rng.next_in(MAKES.len() as u64) as usize].to_string(),
                    model: MODELS[rng.next_in(MODELS.len() as u64) as usize].to_string(),
                    thumbnail: None,
                }
            })
            .collect()
    }
}
