use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::cache::PurgeStats;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Responses stored in the cache")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_REFRESH_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_refresh_total", "Cache entry expiration refreshes")
        .expect("create cache_refresh_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_refresh_total");
    counter
});

static CACHE_REVALIDATION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_revalidation_total",
        "Conditional revalidations by origin result",
    );
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_revalidation_total");
    vec
});

static CACHE_PURGE_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_purge_runs_total", "Completed purge passes")
        .expect("create cache_purge_runs_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_purge_runs_total");
    counter
});

static CACHE_PURGE_REMOVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_purge_removed_total",
        "Files removed by purge, by reason",
    );
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_purge_removed_total");
    vec
});

pub fn record_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_refresh() {
    CACHE_REFRESH_TOTAL.inc();
}

pub fn record_revalidation(not_modified: bool) {
    let result = if not_modified {
        "not_modified"
    } else {
        "modified"
    };
    CACHE_REVALIDATION_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_purge(stats: &PurgeStats) {
    CACHE_PURGE_RUNS_TOTAL.inc();
    CACHE_PURGE_REMOVED_TOTAL
        .with_label_values(&["capacity"])
        .inc_by(stats.evicted as u64);
    CACHE_PURGE_REMOVED_TOTAL
        .with_label_values(&["temp"])
        .inc_by(stats.temp_removed as u64);
    CACHE_PURGE_REMOVED_TOTAL
        .with_label_values(&["orphan"])
        .inc_by(stats.orphans_removed as u64);
}

/// Renders the cache metrics in the Prometheus text format so the host can
/// expose them on whatever endpoint it already serves.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}
