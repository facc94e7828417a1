use anyhow::Result;
use futures::future::BoxFuture;

pub mod collector;
pub mod connection;
pub mod crypto;
pub mod incremental;
pub mod postgres;
pub mod probe;
pub mod schema;
pub mod statements;

pub use collector::{CollectOutcome, StatementsCollector};
pub use connection::{Connection, ConnectionPayload, ConnectionRole, ConnectionView, ValidationError};
pub use probe::{MonitoredDatabaseProbe, MonitoredDbStatus, ReportDatabaseProbe, ReportDbStatus};
pub use statements::{SnapshotKey, StatementRow, StatementStats};

/// A short-lived session with a monitored database, opened for one tick.
pub trait MonitoredSession: Send {
    /// Classify how ready the database is for statement collection.
    fn probe(&mut self) -> BoxFuture<'_, Result<MonitoredDbStatus>>;

    /// Read the current cumulative `pg_stat_statements` rows.
    fn fetch_statements(&mut self) -> BoxFuture<'_, Result<Vec<StatementStats>>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// A short-lived session with a report database, opened for one tick.
pub trait ReportSession: Send {
    fn probe(&mut self) -> BoxFuture<'_, Result<ReportDbStatus>>;

    /// Replace the cumulative rows of `profile` for the minute `key` with
    /// `rows`, committed as one transaction. Returns the rows inserted.
    fn replace_cumulative<'a>(
        &'a mut self,
        profile: &'a str,
        key: SnapshotKey,
        rows: &'a [StatementRow],
    ) -> BoxFuture<'a, Result<u64>>;

    /// Cumulative rows of the two most recent snapshots of `profile`.
    fn latest_snapshots<'a>(
        &'a mut self,
        profile: &'a str,
    ) -> BoxFuture<'a, Result<Vec<StatementRow>>>;

    /// Same as [`ReportSession::replace_cumulative`] for the incremental table.
    fn replace_incremental<'a>(
        &'a mut self,
        profile: &'a str,
        key: SnapshotKey,
        rows: &'a [StatementRow],
    ) -> BoxFuture<'a, Result<u64>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Opens sessions. The production implementation is
/// [`postgres::PgConnector`]; tests substitute an in-memory one.
pub trait Connector: Send + Sync {
    fn monitored<'a>(
        &'a self,
        conn: &'a Connection,
    ) -> BoxFuture<'a, Result<Box<dyn MonitoredSession>>>;

    fn report<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, Result<Box<dyn ReportSession>>>;
}
