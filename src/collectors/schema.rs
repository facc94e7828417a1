//! Report database schema.

use anyhow::{Context, Result};
use sqlx::{Connection as _, PgConnection};
use tracing::info;

pub const SCHEMA: &str = "postgres_stat_profiler";
pub const CUMULATIVE_TABLE: &str = "cumulative_result_pg_stat_statements";
pub const INCREMENTAL_TABLE: &str = "incremental_result_pg_stat_statements";

const RESULT_TABLE_BODY: &str = r"(
    profilename text NOT NULL,
    result_time timestamp NOT NULL,
    result_epoch bigint NOT NULL,
    dbname text,
    username text,
    dbid oid,
    userid oid,
    querytype text,
    queryid bigint,
    query text,
    toplevel boolean,
    calls bigint,
    total_exec_time double precision,
    min_exec_time double precision,
    max_exec_time double precision,
    mean_exec_time double precision,
    stddev_exec_time double precision,
    rows bigint,
    plans bigint,
    total_plan_time double precision,
    min_plan_time double precision,
    max_plan_time double precision,
    stddev_plan_time double precision,
    shared_blks_hit bigint,
    shared_blks_read bigint,
    shared_blks_dirtied bigint,
    shared_blks_written bigint,
    local_blks_hit bigint,
    local_blks_read bigint,
    local_blks_dirtied bigint,
    local_blks_written bigint,
    temp_blks_read bigint,
    temp_blks_written bigint,
    blk_read_time double precision,
    blk_write_time double precision,
    wal_bytes numeric,
    wal_records bigint,
    wal_fpi bigint
)";

/// Idempotent DDL for the report schema, in execution order.
pub fn statements() -> Vec<String> {
    let mut stmts = vec![format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}")];

    for table in [CUMULATIVE_TABLE, INCREMENTAL_TABLE] {
        stmts.push(format!(
            "CREATE TABLE IF NOT EXISTS {SCHEMA}.{table} {RESULT_TABLE_BODY}"
        ));
        stmts.push(format!(
            "CREATE INDEX IF NOT EXISTS {table}_profile_epoch_idx ON {SCHEMA}.{table} (profilename, result_epoch)"
        ));
    }

    stmts
}

/// Create the report schema on `conn` inside one transaction.
///
/// # Errors
///
/// Returns an error if any statement fails; nothing is created in that case.
pub async fn apply(conn: &mut PgConnection) -> Result<()> {
    let mut tx = conn.begin().await?;

    for stmt in statements() {
        sqlx::query(&stmt)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to execute: {stmt}"))?;
    }

    tx.commit().await?;

    info!(schema = SCHEMA, "report schema initialised");

    Ok(())
}
