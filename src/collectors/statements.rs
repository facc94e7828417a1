use crate::collectors::crypto::{CipherError, QueryCipher};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Report-side columns, in table order. Both result tables share this shape.
pub const RESULT_COLUMNS: &[&str] = &[
    "profilename",
    "result_time",
    "result_epoch",
    "dbname",
    "username",
    "dbid",
    "userid",
    "querytype",
    "queryid",
    "query",
    "toplevel",
    "calls",
    "total_exec_time",
    "min_exec_time",
    "max_exec_time",
    "mean_exec_time",
    "stddev_exec_time",
    "rows",
    "plans",
    "total_plan_time",
    "min_plan_time",
    "max_plan_time",
    "stddev_plan_time",
    "shared_blks_hit",
    "shared_blks_read",
    "shared_blks_dirtied",
    "shared_blks_written",
    "local_blks_hit",
    "local_blks_read",
    "local_blks_dirtied",
    "local_blks_written",
    "temp_blks_read",
    "temp_blks_written",
    "blk_read_time",
    "blk_write_time",
    "wal_bytes",
    "wal_records",
    "wal_fpi",
];

/// Minute bucket a sample belongs to. Two ticks inside the same minute share
/// a key, which is what keeps the result tables free of duplicate buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey {
    pub time: NaiveDateTime,
    pub epoch: i64,
}

impl SnapshotKey {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        Self {
            time: minute.naive_utc(),
            epoch: minute.timestamp(),
        }
    }
}

/// Counter vector of one `pg_stat_statements` entry.
///
/// Most fields are cumulative since the last statistics reset; the min, max,
/// mean and stddev timings are gauges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub calls: i64,
    pub total_exec_time: f64,
    pub min_exec_time: f64,
    pub max_exec_time: f64,
    pub mean_exec_time: f64,
    pub stddev_exec_time: f64,
    pub rows: i64,
    pub plans: i64,
    pub total_plan_time: f64,
    pub min_plan_time: f64,
    pub max_plan_time: f64,
    pub stddev_plan_time: f64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub shared_blks_dirtied: i64,
    pub shared_blks_written: i64,
    pub local_blks_hit: i64,
    pub local_blks_read: i64,
    pub local_blks_dirtied: i64,
    pub local_blks_written: i64,
    pub temp_blks_read: i64,
    pub temp_blks_written: i64,
    pub blk_read_time: f64,
    pub blk_write_time: f64,
    pub wal_bytes: i64,
    pub wal_records: i64,
    pub wal_fpi: i64,
}

/// One row as read from the monitored `pg_stat_statements` view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatementStats {
    pub dbname: String,
    pub username: String,
    pub dbid: i64,
    pub userid: i64,
    pub queryid: i64,
    pub query: String,
    pub toplevel: bool,
    pub counters: Counters,
}

/// Identity of a statement across snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatementKey {
    pub dbid: i64,
    pub userid: i64,
    pub queryid: i64,
    pub toplevel: bool,
}

/// A row of either result table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatementRow {
    pub profilename: String,
    pub result_time: NaiveDateTime,
    pub result_epoch: i64,
    pub dbname: String,
    pub username: String,
    pub dbid: i64,
    pub userid: i64,
    pub querytype: String,
    pub queryid: i64,
    pub query: String,
    pub toplevel: bool,
    pub counters: Counters,
}

impl StatementRow {
    /// Build the cumulative row for a freshly collected statement. The query
    /// type is taken from the clear text before it is optionally encrypted.
    ///
    /// # Errors
    ///
    /// Returns a [`CipherError`] if the query text cannot be encrypted.
    pub fn cumulative(
        profilename: &str,
        key: SnapshotKey,
        stats: StatementStats,
        cipher: Option<&QueryCipher>,
    ) -> Result<Self, CipherError> {
        let querytype = query_type(&stats.query);
        let query = match cipher {
            Some(cipher) => cipher.encrypt(&stats.query)?,
            None => stats.query,
        };

        Ok(Self {
            profilename: profilename.to_string(),
            result_time: key.time,
            result_epoch: key.epoch,
            dbname: stats.dbname,
            username: stats.username,
            dbid: stats.dbid,
            userid: stats.userid,
            querytype,
            queryid: stats.queryid,
            query,
            toplevel: stats.toplevel,
            counters: stats.counters,
        })
    }

    pub const fn key(&self) -> StatementKey {
        StatementKey {
            dbid: self.dbid,
            userid: self.userid,
            queryid: self.queryid,
            toplevel: self.toplevel,
        }
    }
}

/// Leading SQL keyword of a statement, upper-cased (`SELECT`, `WITH`, ...).
pub fn query_type(query: &str) -> String {
    let mut rest = query.trim_start();

    // skip leading comments
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped
                .split_once('\n')
                .map_or("", |(_, tail)| tail)
                .trim_start();
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = stripped
                .split_once("*/")
                .map_or("", |(_, tail)| tail)
                .trim_start();
        } else {
            break;
        }
    }

    let word: String = rest
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect();

    if word.is_empty() {
        "UNKNOWN".to_string()
    } else {
        word.to_ascii_uppercase()
    }
}
