//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration for the sort-and-aggregate engine, supporting
//! TOML files and environment variables with validation and type-safe access
//! to all tuning knobs.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration files (TOML), environment variables
//! - **Output**: Validated configuration structs with defaults and overrides
//! - **Validation**: Range checks with detailed error messages
//!
//! ## Configuration Sources (in order of precedence)
//! 1. Command line arguments (applied by the binary)
//! 2. Environment variables
//! 3. Configuration files
//! 4. Default values (lowest priority)

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure containing all engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote paginated listing API settings
    pub source: SourceConfig,
    /// Page aggregation settings
    pub aggregator: AggregatorConfig,
    /// Sorting and background worker settings
    pub sorter: SorterConfig,
    /// Two-tier cache settings
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Remote paginated listing API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// API base URL for the list-records endpoint
    pub base_url: String,
    /// API key for authentication (optional)
    pub api_key: Option<String>,
    /// Per-request timeout in seconds; a timed-out fetch is retryable
    pub request_timeout_seconds: u64,
}

/// Page aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Records requested per page
    pub page_size: usize,
    /// Maximum concurrent in-flight page fetches
    pub fan_out: usize,
    /// Attempts per page before aggregation fails
    pub retry_attempts: u32,
    /// Base backoff delay in milliseconds (doubles per retry)
    pub retry_base_delay_ms: u64,
    /// Backoff delay cap in milliseconds
    pub retry_max_delay_ms: u64,
    /// Minimum spacing between page requests in milliseconds
    pub inter_page_delay_ms: u64,
}

/// Sorting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorterConfig {
    /// Record count at or above which sorting moves to the background worker
    pub worker_threshold: usize,
    /// Fixed chunk size for the worker's chunk-sort phase
    pub chunk_size: usize,
    /// Overall deadline for a background sort in seconds
    pub sort_timeout_seconds: u64,
    /// Threads available to the chunk-sort phase
    pub chunk_parallelism: usize,
}

/// Two-tier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory tier capacity in entries (strict LRU)
    pub memory_capacity: usize,
    /// Memory tier TTL in seconds
    pub memory_ttl_seconds: u64,
    /// Durable tier TTL in seconds
    pub durable_ttl_seconds: u64,
    /// Durable store database path
    pub durable_path: PathBuf,
    /// Compress durable entries with gzip
    pub enable_compression: bool,
    /// Drop expired durable entries at startup
    pub sweep_on_startup: bool,
    /// Optional TTL for the aggregated-records memo in seconds (0 disables)
    pub memo_ttl_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable structured JSON logging
    pub json_format: bool,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    /// Load configuration from a specific file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!("Configuration file not found: {:?}, using defaults", path);
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            message: format!("Failed to read config file {:?}: {}", path, e),
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| EngineError::Config {
            message: format!("Failed to parse config file {:?}: {}", path, e),
        })?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(base_url) = std::env::var("AUCTION_ENGINE_BASE_URL") {
            self.source.base_url = base_url;
        }
        if let Ok(api_key) = std::env::var("AUCTION_ENGINE_API_KEY") {
            self.source.api_key = Some(api_key);
        }
        if let Ok(cache_path) = std::env::var("AUCTION_ENGINE_CACHE_PATH") {
            self.cache.durable_path = PathBuf::from(cache_path);
        }
        if let Ok(level) = std::env::var("AUCTION_ENGINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(fan_out) = std::env::var("AUCTION_ENGINE_FAN_OUT") {
            self.aggregator.fan_out = fan_out.parse().map_err(|_| EngineError::Config {
                message: "Invalid value in AUCTION_ENGINE_FAN_OUT".to_string(),
            })?;
        }
        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.source.base_url.trim().is_empty() {
            return Err(EngineError::Config {
                message: "source.base_url cannot be empty".to_string(),
            });
        }
        if self.aggregator.page_size == 0 {
            return Err(EngineError::Config {
                message: "aggregator.page_size must be greater than zero".to_string(),
            });
        }
        if self.aggregator.fan_out == 0 {
            return Err(EngineError::Config {
                message: "aggregator.fan_out must be greater than zero".to_string(),
            });
        }
        if self.aggregator.retry_attempts == 0 {
            return Err(EngineError::Config {
                message: "aggregator.retry_attempts must be at least one".to_string(),
            });
        }
        if self.aggregator.retry_base_delay_ms > self.aggregator.retry_max_delay_ms {
            return Err(EngineError::Config {
                message: "aggregator.retry_base_delay_ms cannot exceed retry_max_delay_ms"
                    .to_string(),
            });
        }
        if self.sorter.chunk_size == 0 {
            return Err(EngineError::Config {
                message: "sorter.chunk_size must be greater than zero".to_string(),
            });
        }
        if self.sorter.worker_threshold == 0 {
            return Err(EngineError::Config {
                message: "sorter.worker_threshold must be greater than zero".to_string(),
            });
        }
        if self.cache.memory_capacity == 0 {
            return Err(EngineError::Config {
                message: "cache.memory_capacity must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Per-request timeout at the source boundary
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_seconds)
    }

    /// Overall deadline for a background sort
    pub fn sort_timeout(&self) -> Duration {
        Duration::from_secs(self.sorter.sort_timeout_seconds)
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config {
            message: format!("Failed to serialize config to TOML: {}", e),
        })
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                base_url: "https://api.auction-catalog.example/v1/listings".to_string(),
                api_key: None,
                request_timeout_seconds: 15,
            },
            aggregator: AggregatorConfig {
                page_size: 100,
                fan_out: 4,
                retry_attempts: 3,
                retry_base_delay_ms: 500,
                retry_max_delay_ms: 8_000,
                inter_page_delay_ms: 100,
            },
            sorter: SorterConfig {
                worker_threshold: 50_000,
                chunk_size: 10_000,
                sort_timeout_seconds: 30,
                chunk_parallelism: num_cpus::get(),
            },
            cache: CacheConfig {
                memory_capacity: 50,
                memory_ttl_seconds: 600,
                durable_ttl_seconds: 1_800,
                durable_path: PathBuf::from("./data/sort_cache.db"),
                enable_compression: true,
                sweep_on_startup: true,
                memo_ttl_seconds: 0,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}
