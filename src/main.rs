//! # Auction Sort Engine CLI Driver
//!
//! ## Purpose
//! One-shot driver for the sort-and-aggregate engine: aggregates the
//! configured listing API for a filter set, sorts by the requested key, and
//! prints a page of the globally ordered result.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration file, CLI arguments (sort key, filters, page)
//! - **Output**: A page of sorted records plus engine diagnostics
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging and tracing
//! 3. Build the coordinator (HTTP source, sled store, two-tier cache)
//! 4. Apply filters, run the sort-key change, print the requested page

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use auction_sort_engine::store::SledStore;
use auction_sort_engine::utils::{format_bytes, format_duration_ms, Timer};
use auction_sort_engine::{
    Config, EngineState, FilterSet, FilterValue, SortCoordinator, SortKey,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("auction-sort-cli")
        .version("0.1.0")
        .about("Global sort-and-aggregate engine for paginated auction listings")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("sort")
                .short('s')
                .long("sort")
                .value_name("FIELD:DIRECTION")
                .help("Sort key, e.g. price:asc or year:desc")
                .default_value("price:asc"),
        )
        .arg(
            Arg::new("filter")
                .short('f')
                .long("filter")
                .value_name("KEY=VALUE")
                .help("Filter (repeatable): text, a,b lists, or min..max ranges")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("page")
                .short('p')
                .long("page")
                .value_name("N")
                .help("Page number to print")
                .value_parser(clap::value_parser!(usize))
                .default_value("1"),
        )
        .arg(
            Arg::new("page-size")
                .long("page-size")
                .value_name("N")
                .help("Records per page")
                .value_parser(clap::value_parser!(usize))
                .default_value("50"),
        )
        .arg(
            Arg::new("clear-cache")
                .long("clear-cache")
                .help("Clear both cache tiers before running")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-health")
                .long("check-health")
                .help("Run durable store health checks and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("defaulted");
    let config = Config::from_file(config_path)?;

    init_logging(&config)?;
    info!("auction sort engine starting (config: {})", config_path);

    if matches.get_flag("check-health") {
        return run_health_checks(&config).await;
    }

    let sort_key: SortKey = matches
        .get_one::<String>("sort")
        .expect("defaulted")
        .parse()?;
    let page = *matches.get_one::<usize>("page").expect("defaulted");
    let page_size = *matches.get_one::<usize>("page-size").expect("defaulted");

    let filters = parse_filters(
        matches
            .get_many::<String>("filter")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
    )?;

    let coordinator = SortCoordinator::from_config(&config).await?;
    if matches.get_flag("clear-cache") {
        coordinator.clear_cache().await?;
        info!("cache cleared");
    }

    coordinator.set_filters(filters).await;

    let timer = Timer::new("aggregate-and-sort");
    let snapshot = coordinator.on_sort_change(sort_key).await;
    let elapsed = timer.stop();

    match snapshot.state {
        EngineState::Ready => {
            let view = coordinator.get_page(page, page_size).await;
            info!(
                "{} records sorted by {} in {} (page {}/{})",
                view.total,
                sort_key,
                format_duration_ms(elapsed),
                view.current_page,
                view.total_pages
            );
            for record in &view.items {
                println!(
                    "{}  {:<12} {:<14} year={} price={} mileage={}",
                    record.id,
                    record.make,
                    record.model,
                    record.year.map_or("-".to_string(), |y| y.to_string()),
                    record.price.map_or("-".to_string(), |p| format!("{:.0}", p)),
                    record.mileage.map_or("-".to_string(), |m| format!("{:.0}", m)),
                );
            }

            let diagnostics = coordinator.diagnostics().await;
            info!(
                "fetch {}ms, sort {}ms, cache hits {} (memory) / {} (durable)",
                diagnostics.last_fetch_duration_ms.unwrap_or(0),
                diagnostics.last_sort_duration_ms.unwrap_or(0),
                diagnostics.cache.memory_hits,
                diagnostics.cache.durable_hits,
            );
            Ok(())
        }
        EngineState::Error => {
            let message = snapshot.error.unwrap_or_else(|| "unknown failure".to_string());
            error!("engine failed: {}", message);
            Err(anyhow!(message))
        }
        other => Err(anyhow!("engine settled in unexpected state {:?}", other)),
    }
}

/// Initialize logging and tracing
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Run durable store health checks and exit
async fn run_health_checks(config: &Config) -> anyhow::Result<()> {
    let store = SledStore::open(&config.cache.durable_path)
        .await
        .context("durable store unavailable")?;
    store.health_check().await.context("health check failed")?;
    info!(
        "durable store healthy at {:?} ({} on disk)",
        config.cache.durable_path,
        format_bytes(store.size_on_disk().unwrap_or(0)),
    );
    Ok(())
}

/// Parse `key=value` filter arguments.
///
/// `a,b,c` values become multi-select lists and `min..max` values become
/// ranges (either bound may be omitted); anything else is text.
fn parse_filters(args: Vec<String>) -> anyhow::Result<FilterSet> {
    let mut filters = FilterSet::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid filter '{}', expected KEY=VALUE", arg))?;

        let parsed = if let Some((min, max)) = value.split_once("..") {
            FilterValue::Range {
                min: parse_bound(min)?,
                max: parse_bound(max)?,
            }
        } else if value.contains(',') {
            FilterValue::List(value.split(',').map(|s| s.trim().to_string()).collect())
        } else {
            FilterValue::Text(value.to_string())
        };
        filters.set(key.trim(), parsed);
    }
    Ok(filters)
}

fn parse_bound(raw: &str) -> anyhow::Result<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| anyhow!("invalid range bound '{}'", raw))
}
