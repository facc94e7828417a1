//! Incremental (per-interval) rows derived from the two most recent cumulative
//! snapshots of a profile.
//!
//! Policy:
//! - a single snapshot (first run) yields nothing;
//! - a key seen in both snapshots yields `current - previous` for every
//!   cumulative counter;
//! - a key whose cumulative counters went backwards (statistics reset) or that
//!   is new in the current snapshot started fresh: its delta is the current
//!   value;
//! - keys without new calls are not emitted;
//! - min/max/stddev timings are gauges and carry the current value, the mean
//!   is recomputed over the interval.

use crate::collectors::statements::{Counters, StatementKey, StatementRow};
use std::collections::HashMap;

/// Compute the incremental rows from cumulative rows of at most two
/// snapshots. Rows of older snapshots, if any, are ignored.
pub fn compute(rows: &[StatementRow]) -> Vec<StatementRow> {
    let mut epochs: Vec<i64> = rows.iter().map(|r| r.result_epoch).collect();
    epochs.sort_unstable();
    epochs.dedup();

    let (previous_epoch, current_epoch) = match epochs.as_slice() {
        [.., previous, current] => (*previous, *current),
        _ => return Vec::new(),
    };

    let previous: HashMap<StatementKey, &StatementRow> = rows
        .iter()
        .filter(|r| r.result_epoch == previous_epoch)
        .map(|r| (r.key(), r))
        .collect();

    let mut out: Vec<StatementRow> = rows
        .iter()
        .filter(|r| r.result_epoch == current_epoch)
        .filter_map(|current| {
            let counters = match previous.get(&current.key()) {
                Some(prev) => delta(&current.counters, &prev.counters),
                None => fresh(&current.counters),
            };

            (counters.calls > 0).then(|| StatementRow {
                counters,
                ..current.clone()
            })
        })
        .collect();

    out.sort_by_key(StatementRow::key);
    out
}

/// Delta between two cumulative readings of the same statement.
pub fn delta(current: &Counters, previous: &Counters) -> Counters {
    if is_reset(current, previous) {
        return fresh(current);
    }

    let mut d = Counters {
        calls: current.calls - previous.calls,
        total_exec_time: current.total_exec_time - previous.total_exec_time,
        rows: current.rows - previous.rows,
        plans: current.plans - previous.plans,
        total_plan_time: current.total_plan_time - previous.total_plan_time,
        shared_blks_hit: current.shared_blks_hit - previous.shared_blks_hit,
        shared_blks_read: current.shared_blks_read - previous.shared_blks_read,
        shared_blks_dirtied: current.shared_blks_dirtied - previous.shared_blks_dirtied,
        shared_blks_written: current.shared_blks_written - previous.shared_blks_written,
        local_blks_hit: current.local_blks_hit - previous.local_blks_hit,
        local_blks_read: current.local_blks_read - previous.local_blks_read,
        local_blks_dirtied: current.local_blks_dirtied - previous.local_blks_dirtied,
        local_blks_written: current.local_blks_written - previous.local_blks_written,
        temp_blks_read: current.temp_blks_read - previous.temp_blks_read,
        temp_blks_written: current.temp_blks_written - previous.temp_blks_written,
        blk_read_time: current.blk_read_time - previous.blk_read_time,
        blk_write_time: current.blk_write_time - previous.blk_write_time,
        wal_bytes: current.wal_bytes - previous.wal_bytes,
        wal_records: current.wal_records - previous.wal_records,
        wal_fpi: current.wal_fpi - previous.wal_fpi,
        ..carry_gauges(current)
    };

    d.mean_exec_time = interval_mean(d.total_exec_time, d.calls, current.mean_exec_time);
    d
}

/// A statement that started fresh inside the interval.
fn fresh(current: &Counters) -> Counters {
    current.clone()
}

// Any cumulative counter going backwards means pg_stat_statements was reset
// (or the entry was evicted and re-created) between the two snapshots.
fn is_reset(current: &Counters, previous: &Counters) -> bool {
    let ints = [
        (current.calls, previous.calls),
        (current.rows, previous.rows),
        (current.plans, previous.plans),
        (current.shared_blks_hit, previous.shared_blks_hit),
        (current.shared_blks_read, previous.shared_blks_read),
        (current.shared_blks_dirtied, previous.shared_blks_dirtied),
        (current.shared_blks_written, previous.shared_blks_written),
        (current.local_blks_hit, previous.local_blks_hit),
        (current.local_blks_read, previous.local_blks_read),
        (current.local_blks_dirtied, previous.local_blks_dirtied),
        (current.local_blks_written, previous.local_blks_written),
        (current.temp_blks_read, previous.temp_blks_read),
        (current.temp_blks_written, previous.temp_blks_written),
        (current.wal_bytes, previous.wal_bytes),
        (current.wal_records, previous.wal_records),
        (current.wal_fpi, previous.wal_fpi),
    ];

    let floats = [
        (current.total_exec_time, previous.total_exec_time),
        (current.total_plan_time, previous.total_plan_time),
        (current.blk_read_time, previous.blk_read_time),
        (current.blk_write_time, previous.blk_write_time),
    ];

    ints.iter().any(|(c, p)| c < p) || floats.iter().any(|(c, p)| c < p)
}

fn carry_gauges(current: &Counters) -> Counters {
    Counters {
        min_exec_time: current.min_exec_time,
        max_exec_time: current.max_exec_time,
        mean_exec_time: current.mean_exec_time,
        stddev_exec_time: current.stddev_exec_time,
        min_plan_time: current.min_plan_time,
        max_plan_time: current.max_plan_time,
        stddev_plan_time: current.stddev_plan_time,
        ..Counters::default()
    }
}

#[allow(clippy::cast_precision_loss)]
fn interval_mean(total: f64, calls: i64, fallback: f64) -> f64 {
    if calls > 0 {
        total / calls as f64
    } else {
        fallback
    }
}
