#![allow(dead_code)]

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use pg_stat_profiler::collectors::statements::Counters;
use pg_stat_profiler::collectors::{
    Connection, Connector, MonitoredDbStatus, MonitoredSession, ReportDbStatus, ReportSession,
    SnapshotKey, StatementRow, StatementStats,
};
use pg_stat_profiler::profile::{Profile, ProfilePayload};
use pg_stat_profiler::store::{ProfileStore, StoreHandle, handle};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::TempDir;

pub const CONFIG_SECRET: &str = "integration-config-secret";

/// base64 of "profile-query-secret"
pub const QUERY_SECRET: &str = "cHJvZmlsZS1xdWVyeS1zZWNyZXQ=";

/// What the fake databases answer, and what was written to the fake report
/// tables.
#[derive(Debug)]
pub struct StubState {
    pub monitored_status: MonitoredDbStatus,
    pub report_status: ReportDbStatus,
    pub unreachable: bool,
    pub statements: Vec<StatementStats>,
    /// Number of upcoming fetches that panic.
    pub panics: usize,
    /// Fetches never return while set.
    pub stall: bool,
    pub fetches: usize,
    /// Monitored sessions dropped so far, including by an aborted worker.
    pub sessions_dropped: usize,
    pub cumulative: Vec<StatementRow>,
    pub incremental: Vec<StatementRow>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            monitored_status: MonitoredDbStatus::Operational,
            report_status: ReportDbStatus::Initialised,
            unreachable: false,
            statements: Vec::new(),
            panics: 0,
            stall: false,
            fetches: 0,
            sessions_dropped: 0,
            cumulative: Vec::new(),
            incremental: Vec::new(),
        }
    }
}

/// In-memory stand-in for both databases of a profile.
#[derive(Clone, Default)]
pub struct StubConnector {
    state: Arc<Mutex<StubState>>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, StubState> {
        lock(&self.state)
    }

    pub fn cumulative_for(&self, profile: &str) -> Vec<StatementRow> {
        rows_for(&self.state().cumulative, profile)
    }

    pub fn incremental_for(&self, profile: &str) -> Vec<StatementRow> {
        rows_for(&self.state().incremental, profile)
    }
}

fn lock(state: &Mutex<StubState>) -> MutexGuard<'_, StubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rows_for(rows: &[StatementRow], profile: &str) -> Vec<StatementRow> {
    rows.iter()
        .filter(|r| r.profilename == profile)
        .cloned()
        .collect()
}

fn replace(table: &mut Vec<StatementRow>, profile: &str, key: SnapshotKey, rows: &[StatementRow]) -> u64 {
    table.retain(|r| !(r.profilename == profile && r.result_epoch == key.epoch));
    table.extend(rows.iter().cloned());
    rows.len() as u64
}

impl Connector for StubConnector {
    fn monitored<'a>(
        &'a self,
        _conn: &'a Connection,
    ) -> BoxFuture<'a, Result<Box<dyn MonitoredSession>>> {
        Box::pin(async move {
            if self.state().unreachable {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(StubMonitored {
                state: Arc::clone(&self.state),
            }) as Box<dyn MonitoredSession>)
        })
    }

    fn report<'a>(&'a self, _conn: &'a Connection) -> BoxFuture<'a, Result<Box<dyn ReportSession>>> {
        Box::pin(async move {
            if self.state().unreachable {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(StubReport {
                state: Arc::clone(&self.state),
            }) as Box<dyn ReportSession>)
        })
    }
}

struct StubMonitored {
    state: Arc<Mutex<StubState>>,
}

impl MonitoredSession for StubMonitored {
    fn probe(&mut self) -> BoxFuture<'_, Result<MonitoredDbStatus>> {
        Box::pin(async move { Ok(lock(&self.state).monitored_status) })
    }

    fn fetch_statements(&mut self) -> BoxFuture<'_, Result<Vec<StatementStats>>> {
        Box::pin(async move {
            let (panic, stall, statements) = {
                let mut state = lock(&self.state);
                state.fetches += 1;
                let panic = state.panics > 0;
                if panic {
                    state.panics -= 1;
                }
                (panic, state.stall, state.statements.clone())
            };

            assert!(!panic, "injected collector failure");

            if stall {
                std::future::pending::<()>().await;
            }

            Ok(statements)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl Drop for StubMonitored {
    fn drop(&mut self) {
        lock(&self.state).sessions_dropped += 1;
    }
}

struct StubReport {
    state: Arc<Mutex<StubState>>,
}

impl ReportSession for StubReport {
    fn probe(&mut self) -> BoxFuture<'_, Result<ReportDbStatus>> {
        Box::pin(async move { Ok(lock(&self.state).report_status) })
    }

    fn replace_cumulative<'a>(
        &'a mut self,
        profile: &'a str,
        key: SnapshotKey,
        rows: &'a [StatementRow],
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move { Ok(replace(&mut lock(&self.state).cumulative, profile, key, rows)) })
    }

    fn latest_snapshots<'a>(
        &'a mut self,
        profile: &'a str,
    ) -> BoxFuture<'a, Result<Vec<StatementRow>>> {
        Box::pin(async move {
            let state = lock(&self.state);
            let rows = rows_for(&state.cumulative, profile);

            let mut epochs: Vec<i64> = rows.iter().map(|r| r.result_epoch).collect();
            epochs.sort_unstable_by(|a, b| b.cmp(a));
            epochs.dedup();
            epochs.truncate(2);

            Ok(rows
                .into_iter()
                .filter(|r| epochs.contains(&r.result_epoch))
                .collect())
        })
    }

    fn replace_incremental<'a>(
        &'a mut self,
        profile: &'a str,
        key: SnapshotKey,
        rows: &'a [StatementRow],
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move { Ok(replace(&mut lock(&self.state).incremental, profile, key, rows)) })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A `pg_stat_statements` entry with the given cumulative counts.
pub fn statement(queryid: i64, query: &str, calls: i64, total_exec_time: f64) -> StatementStats {
    StatementStats {
        dbname: "app".to_string(),
        username: "app_user".to_string(),
        dbid: 16384,
        userid: 10,
        queryid,
        query: query.to_string(),
        toplevel: true,
        counters: Counters {
            calls,
            total_exec_time,
            min_exec_time: 0.5,
            max_exec_time: 9.0,
            mean_exec_time: total_exec_time / calls.max(1) as f64,
            rows: calls * 2,
            shared_blks_hit: calls * 10,
            ..Counters::default()
        },
    }
}

pub fn payload_json(status: &str, encrypted: bool) -> Value {
    let mut body = json!({
        "status": status,
        "queryencryption": if encrypted { "enabled" } else { "disabled" },
        "monitored_connection": {
            "host": "db1.internal",
            "port": 5432,
            "dbname": "app",
            "username": "monitor",
            "password": "monitor-pw"
        },
        "report_connection": {
            "host": "reports.internal",
            "dbname": "reports",
            "username": "writer",
            "password": "writer-pw"
        }
    });

    if encrypted {
        body["queryencryptionsecret"] = json!(QUERY_SECRET);
    }

    body
}

pub fn payload(status: &str, encrypted: bool) -> ProfilePayload {
    serde_json::from_value(payload_json(status, encrypted)).unwrap()
}

pub fn profile(name: &str, encrypted: bool) -> Profile {
    Profile::from_payload(name, payload("enabled", encrypted)).unwrap()
}

pub fn config_secret() -> SecretString {
    SecretString::from(CONFIG_SECRET)
}

/// A profile store in a fresh temporary directory, served on its own thread.
pub fn spawn_store() -> (TempDir, StoreHandle) {
    let dir = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(dir.path().join(".pg-stat-profiler.prof"), &config_secret()).unwrap();
    let (handle, _thread) = handle::spawn(store).unwrap();
    (dir, handle)
}

/// Poll `cond` every 10ms for up to `timeout`.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cond()
}
