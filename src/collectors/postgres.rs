//! PostgreSQL implementation of the collector sessions.

use crate::collectors::schema::{CUMULATIVE_TABLE, INCREMENTAL_TABLE, SCHEMA};
use crate::collectors::statements::{Counters, RESULT_COLUMNS};
use crate::collectors::{
    Connection, Connector, MonitoredDbStatus, MonitoredSession, ReportDbStatus, ReportSession,
    SnapshotKey, StatementRow, StatementStats,
};
use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{Connection as _, PgConnection, Row};
use std::time::Duration;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

/// Oldest server whose `pg_stat_statements` has the columns we read.
pub const MIN_SERVER_VERSION: i32 = 130_000;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens one fresh `PgConnection` per session; nothing is pooled across
/// ticks.
#[derive(Clone, Debug)]
pub struct PgConnector {
    connect_timeout: Duration,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, conn: &Connection) -> Result<PgConnection> {
        let opts = conn.connect_options();

        tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&opts))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {conn}"))?
            .with_context(|| format!("Failed to connect to {conn}"))
    }
}

impl Connector for PgConnector {
    fn monitored<'a>(
        &'a self,
        conn: &'a Connection,
    ) -> BoxFuture<'a, Result<Box<dyn MonitoredSession>>> {
        Box::pin(async move {
            let pg = self.connect(conn).await?;
            Ok(Box::new(PgMonitoredSession {
                conn: pg,
                server_version: None,
            }) as Box<dyn MonitoredSession>)
        })
    }

    fn report<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, Result<Box<dyn ReportSession>>> {
        Box::pin(async move {
            let pg = self.connect(conn).await?;
            Ok(Box::new(PgReportSession { conn: pg }) as Box<dyn ReportSession>)
        })
    }
}

pub struct PgMonitoredSession {
    conn: PgConnection,
    server_version: Option<i32>,
}

impl PgMonitoredSession {
    async fn server_version(&mut self) -> Result<i32> {
        if let Some(version) = self.server_version {
            return Ok(version);
        }

        let version: i32 = sqlx::query_scalar("SELECT current_setting('server_version_num')::int")
            .fetch_one(&mut self.conn)
            .await?;

        self.server_version = Some(version);
        Ok(version)
    }
}

impl MonitoredSession for PgMonitoredSession {
    fn probe(&mut self) -> BoxFuture<'_, Result<MonitoredDbStatus>> {
        Box::pin(
            async move {
                let version = self.server_version().await?;
                if version < MIN_SERVER_VERSION {
                    return Ok(MonitoredDbStatus::Unsupported);
                }

                let installed: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements')",
                )
                .fetch_one(&mut self.conn)
                .await?;

                if !installed {
                    return Ok(MonitoredDbStatus::ExtensionMissing);
                }

                // fails when the library is not in shared_preload_libraries
                if let Err(e) = sqlx::query("SELECT 1 FROM pg_stat_statements LIMIT 1")
                    .fetch_optional(&mut self.conn)
                    .await
                {
                    debug!(error = %e, "pg_stat_statements not readable");
                    return Ok(MonitoredDbStatus::ExtensionMissing);
                }

                let privileged: bool = sqlx::query_scalar(
                    r"
                    SELECT pg_has_role(current_user, 'pg_read_all_stats', 'MEMBER')
                        OR COALESCE((SELECT rolsuper FROM pg_roles WHERE rolname = current_user), false)
                    ",
                )
                .fetch_one(&mut self.conn)
                .await?;

                if !privileged {
                    return Ok(MonitoredDbStatus::InsufficientPrivilege);
                }

                Ok(MonitoredDbStatus::Operational)
            }
            .instrument(info_span!("monitored.probe")),
        )
    }

    fn fetch_statements(&mut self) -> BoxFuture<'_, Result<Vec<StatementStats>>> {
        Box::pin(
            async move {
                let version = self.server_version().await?;
                let rows = sqlx::query(&collect_query(version))
                    .fetch_all(&mut self.conn)
                    .await?;

                let stats = rows
                    .iter()
                    .map(decode_stats)
                    .collect::<Result<Vec<_>, _>>()?;

                debug!(statements = stats.len(), "read pg_stat_statements");
                Ok(stats)
            }
            .instrument(info_span!("monitored.fetch_statements")),
        )
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { Ok(self.conn.close().await?) })
    }
}

pub struct PgReportSession {
    conn: PgConnection,
}

impl PgReportSession {
    async fn replace(
        &mut self,
        table: &str,
        profile: &str,
        key: SnapshotKey,
        rows: &[StatementRow],
    ) -> Result<u64> {
        let mut tx = self.conn.begin().await?;

        sqlx::query(&format!(
            "DELETE FROM {SCHEMA}.{table} WHERE profilename = $1 AND result_epoch = $2"
        ))
        .bind(profile)
        .bind(key.epoch)
        .execute(&mut *tx)
        .await?;

        let sql = insert_sql(table);
        let mut inserted = 0;

        for row in rows {
            inserted += bind_row(sqlx::query(&sql), row)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;

        Ok(inserted)
    }
}

impl ReportSession for PgReportSession {
    fn probe(&mut self) -> BoxFuture<'_, Result<ReportDbStatus>> {
        Box::pin(
            async move {
                for table in [CUMULATIVE_TABLE, INCREMENTAL_TABLE] {
                    let qualified = format!("{SCHEMA}.{table}");

                    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                        .bind(&qualified)
                        .fetch_one(&mut self.conn)
                        .await?;

                    if !exists {
                        return Ok(ReportDbStatus::Uninitialised);
                    }

                    let writable: bool =
                        sqlx::query_scalar("SELECT has_table_privilege($1, 'INSERT')")
                            .bind(&qualified)
                            .fetch_one(&mut self.conn)
                            .await?;

                    if !writable {
                        return Ok(ReportDbStatus::Uninitialised);
                    }
                }

                Ok(ReportDbStatus::Initialised)
            }
            .instrument(info_span!("report.probe")),
        )
    }

    fn replace_cumulative<'a>(
        &'a mut self,
        profile: &'a str,
        key: SnapshotKey,
        rows: &'a [StatementRow],
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(
            self.replace(CUMULATIVE_TABLE, profile, key, rows)
                .instrument(info_span!("report.replace_cumulative")),
        )
    }

    fn latest_snapshots<'a>(
        &'a mut self,
        profile: &'a str,
    ) -> BoxFuture<'a, Result<Vec<StatementRow>>> {
        Box::pin(
            async move {
                let rows = sqlx::query(&latest_snapshots_sql())
                    .bind(profile)
                    .fetch_all(&mut self.conn)
                    .await?;

                Ok(rows
                    .iter()
                    .map(decode_result_row)
                    .collect::<Result<Vec<_>, _>>()?)
            }
            .instrument(info_span!("report.latest_snapshots")),
        )
    }

    fn replace_incremental<'a>(
        &'a mut self,
        profile: &'a str,
        key: SnapshotKey,
        rows: &'a [StatementRow],
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(
            self.replace(INCREMENTAL_TABLE, profile, key, rows)
                .instrument(info_span!("report.replace_incremental")),
        )
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { Ok(self.conn.close().await?) })
    }
}

/// `pg_stat_statements` read query for a server version.
///
/// `toplevel` only exists from 14, and 17 renamed the block timing columns.
pub fn collect_query(server_version: i32) -> String {
    let toplevel = if server_version >= 140_000 {
        "s.toplevel"
    } else {
        "true AS toplevel"
    };

    let (blk_read, blk_write) = if server_version >= 170_000 {
        (
            "s.shared_blk_read_time AS blk_read_time",
            "s.shared_blk_write_time AS blk_write_time",
        )
    } else {
        ("s.blk_read_time", "s.blk_write_time")
    };

    format!(
        r"
        SELECT
            d.datname::text AS dbname,
            r.rolname::text AS username,
            s.dbid::bigint AS dbid,
            s.userid::bigint AS userid,
            s.queryid,
            COALESCE(s.query, '') AS query,
            {toplevel},
            s.calls,
            s.total_exec_time,
            s.min_exec_time,
            s.max_exec_time,
            s.mean_exec_time,
            s.stddev_exec_time,
            s.rows,
            s.plans,
            s.total_plan_time,
            s.min_plan_time,
            s.max_plan_time,
            s.stddev_plan_time,
            s.shared_blks_hit,
            s.shared_blks_read,
            s.shared_blks_dirtied,
            s.shared_blks_written,
            s.local_blks_hit,
            s.local_blks_read,
            s.local_blks_dirtied,
            s.local_blks_written,
            s.temp_blks_read,
            s.temp_blks_written,
            {blk_read},
            {blk_write},
            s.wal_bytes::bigint AS wal_bytes,
            s.wal_records,
            s.wal_fpi
        FROM pg_stat_statements s
        JOIN pg_database d ON d.oid = s.dbid
        JOIN pg_roles r ON r.oid = s.userid
        WHERE s.queryid IS NOT NULL
        "
    )
}

/// Parameterised insert for one row of a result table.
pub fn insert_sql(table: &str) -> String {
    let placeholders: Vec<String> = RESULT_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let n = i + 1;
            match *column {
                "dbid" | "userid" => format!("${n}::oid"),
                "wal_bytes" => format!("${n}::numeric"),
                _ => format!("${n}"),
            }
        })
        .collect();

    format!(
        "INSERT INTO {SCHEMA}.{table} ({}) VALUES ({})",
        RESULT_COLUMNS.join(", "),
        placeholders.join(", ")
    )
}

/// Cumulative rows of the two most recent snapshots of the profile bound to
/// `$1`.
pub fn latest_snapshots_sql() -> String {
    let columns: Vec<String> = RESULT_COLUMNS
        .iter()
        .map(|column| match *column {
            "dbid" | "userid" | "wal_bytes" => format!("{column}::bigint AS {column}"),
            _ => (*column).to_string(),
        })
        .collect();

    format!(
        r"
        SELECT {columns}
        FROM {SCHEMA}.{CUMULATIVE_TABLE}
        WHERE profilename = $1
          AND result_epoch IN (
              SELECT DISTINCT result_epoch
              FROM {SCHEMA}.{CUMULATIVE_TABLE}
              WHERE profilename = $1
              ORDER BY result_epoch DESC
              LIMIT 2
          )
        ",
        columns = columns.join(", ")
    )
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_row<'q>(query: PgQuery<'q>, row: &'q StatementRow) -> PgQuery<'q> {
    let c = &row.counters;

    query
        .bind(&row.profilename)
        .bind(row.result_time)
        .bind(row.result_epoch)
        .bind(&row.dbname)
        .bind(&row.username)
        .bind(row.dbid)
        .bind(row.userid)
        .bind(&row.querytype)
        .bind(row.queryid)
        .bind(&row.query)
        .bind(row.toplevel)
        .bind(c.calls)
        .bind(c.total_exec_time)
        .bind(c.min_exec_time)
        .bind(c.max_exec_time)
        .bind(c.mean_exec_time)
        .bind(c.stddev_exec_time)
        .bind(c.rows)
        .bind(c.plans)
        .bind(c.total_plan_time)
        .bind(c.min_plan_time)
        .bind(c.max_plan_time)
        .bind(c.stddev_plan_time)
        .bind(c.shared_blks_hit)
        .bind(c.shared_blks_read)
        .bind(c.shared_blks_dirtied)
        .bind(c.shared_blks_written)
        .bind(c.local_blks_hit)
        .bind(c.local_blks_read)
        .bind(c.local_blks_dirtied)
        .bind(c.local_blks_written)
        .bind(c.temp_blks_read)
        .bind(c.temp_blks_written)
        .bind(c.blk_read_time)
        .bind(c.blk_write_time)
        .bind(c.wal_bytes)
        .bind(c.wal_records)
        .bind(c.wal_fpi)
}

fn int(row: &PgRow, column: &str) -> Result<i64, sqlx::Error> {
    Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or_default())
}

fn float(row: &PgRow, column: &str) -> Result<f64, sqlx::Error> {
    Ok(row.try_get::<Option<f64>, _>(column)?.unwrap_or_default())
}

fn text(row: &PgRow, column: &str) -> Result<String, sqlx::Error> {
    Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
}

fn decode_counters(row: &PgRow) -> Result<Counters, sqlx::Error> {
    Ok(Counters {
        calls: int(row, "calls")?,
        total_exec_time: float(row, "total_exec_time")?,
        min_exec_time: float(row, "min_exec_time")?,
        max_exec_time: float(row, "max_exec_time")?,
        mean_exec_time: float(row, "mean_exec_time")?,
        stddev_exec_time: float(row, "stddev_exec_time")?,
        rows: int(row, "rows")?,
        plans: int(row, "plans")?,
        total_plan_time: float(row, "total_plan_time")?,
        min_plan_time: float(row, "min_plan_time")?,
        max_plan_time: float(row, "max_plan_time")?,
        stddev_plan_time: float(row, "stddev_plan_time")?,
        shared_blks_hit: int(row, "shared_blks_hit")?,
        shared_blks_read: int(row, "shared_blks_read")?,
        shared_blks_dirtied: int(row, "shared_blks_dirtied")?,
        shared_blks_written: int(row, "shared_blks_written")?,
        local_blks_hit: int(row, "local_blks_hit")?,
        local_blks_read: int(row, "local_blks_read")?,
        local_blks_dirtied: int(row, "local_blks_dirtied")?,
        local_blks_written: int(row, "local_blks_written")?,
        temp_blks_read: int(row, "temp_blks_read")?,
        temp_blks_written: int(row, "temp_blks_written")?,
        blk_read_time: float(row, "blk_read_time")?,
        blk_write_time: float(row, "blk_write_time")?,
        wal_bytes: int(row, "wal_bytes")?,
        wal_records: int(row, "wal_records")?,
        wal_fpi: int(row, "wal_fpi")?,
    })
}

fn decode_stats(row: &PgRow) -> Result<StatementStats, sqlx::Error> {
    Ok(StatementStats {
        dbname: text(row, "dbname")?,
        username: text(row, "username")?,
        dbid: int(row, "dbid")?,
        userid: int(row, "userid")?,
        queryid: int(row, "queryid")?,
        query: text(row, "query")?,
        toplevel: row.try_get::<Option<bool>, _>("toplevel")?.unwrap_or(true),
        counters: decode_counters(row)?,
    })
}

fn decode_result_row(row: &PgRow) -> Result<StatementRow, sqlx::Error> {
    Ok(StatementRow {
        profilename: row.try_get("profilename")?,
        result_time: row.try_get("result_time")?,
        result_epoch: row.try_get("result_epoch")?,
        dbname: text(row, "dbname")?,
        username: text(row, "username")?,
        dbid: int(row, "dbid")?,
        userid: int(row, "userid")?,
        querytype: text(row, "querytype")?,
        queryid: int(row, "queryid")?,
        query: text(row, "query")?,
        toplevel: row.try_get::<Option<bool>, _>("toplevel")?.unwrap_or(true),
        counters: decode_counters(row)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_query_pg13() {
        let sql = collect_query(130_004);
        assert!(sql.contains("true AS toplevel"));
        assert!(sql.contains("s.blk_read_time"));
        assert!(!sql.contains("shared_blk_read_time"));
    }

    #[test]
    fn test_collect_query_pg14() {
        let sql = collect_query(140_010);
        assert!(sql.contains("s.toplevel"));
        assert!(!sql.contains("true AS toplevel"));
        assert!(sql.contains("s.blk_write_time"));
    }

    #[test]
    fn test_collect_query_pg17() {
        let sql = collect_query(170_002);
        assert!(sql.contains("s.shared_blk_read_time AS blk_read_time"));
        assert!(sql.contains("s.shared_blk_write_time AS blk_write_time"));
    }

    #[test]
    fn test_collect_query_selects_every_counter() {
        let sql = collect_query(160_000);
        for column in RESULT_COLUMNS.iter().skip(11) {
            assert!(sql.contains(column), "missing {column}");
        }
    }

    #[test]
    fn test_insert_sql_placeholders() {
        let sql = insert_sql(CUMULATIVE_TABLE);

        assert!(sql.starts_with(
            "INSERT INTO postgres_stat_profiler.cumulative_result_pg_stat_statements (profilename, result_time"
        ));
        assert!(sql.contains("$6::oid, $7::oid"));
        assert!(sql.contains("$36::numeric"));
        assert!(sql.ends_with("$38)"));
        assert!(!sql.contains("$39"));
    }

    #[test]
    fn test_latest_snapshots_sql() {
        let sql = latest_snapshots_sql();

        assert!(sql.contains("dbid::bigint AS dbid"));
        assert!(sql.contains("wal_bytes::bigint AS wal_bytes"));
        assert!(sql.contains("ORDER BY result_epoch DESC"));
        assert!(sql.contains("LIMIT 2"));
        assert!(!sql.contains(INCREMENTAL_TABLE));
    }
}
