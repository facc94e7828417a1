//! Process-wide self-monitoring metrics, served on `/metrics`.

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Collection ticks by profile and outcome (`collected`, `skipped`, `failed`).
pub static COLLECT_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "pg_stat_profiler_collect_ticks_total",
        "Collection ticks by profile and outcome",
        &["profile", "outcome"],
    )
});

/// Rows written to the report database by profile and table.
pub static ROWS_INSERTED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "pg_stat_profiler_rows_inserted_total",
        "Rows written to the report database",
        &["profile", "table"],
    )
});

/// Restarts performed by the supervisor (`worker`, `log_sink`).
pub static RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "pg_stat_profiler_restarts_total",
        "Components restarted by the supervisor",
        &["component"],
    )
});

pub static LOG_RECORDS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    counter_vec(
        "pg_stat_profiler_log_records_dropped_total",
        "Log records dropped because the log queue was full",
        &[],
    )
    .with_label_values(&[] as &[&str])
});

// Metric names and labels are compile-time constants, so construction cannot
// fail at runtime.
#[allow(clippy::expect_used)]
fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition");

    if let Err(e) = REGISTRY.register(Box::new(vec.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }

    vec
}

/// Touch every metric so that it shows up before its first increment.
pub fn init() {
    Lazy::force(&COLLECT_TICKS);
    Lazy::force(&ROWS_INSERTED);
    Lazy::force(&RESTARTS);
    Lazy::force(&LOG_RECORDS_DROPPED);
}

/// Encode the registry in the Prometheus text format.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
