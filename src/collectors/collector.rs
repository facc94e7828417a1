//! One collection tick: cumulative snapshot plus incremental delta for a
//! profile.

use crate::collectors::schema::{CUMULATIVE_TABLE, INCREMENTAL_TABLE};
use crate::collectors::{
    Connection, Connector, MonitoredDatabaseProbe, MonitoredDbStatus, MonitoredSession,
    ReportDatabaseProbe, ReportDbStatus, ReportSession, SnapshotKey, StatementRow, incremental,
};
use crate::metrics;
use crate::profile::Profile;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info_span, instrument, warn};
use tracing_futures::Instrument as _;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectOutcome {
    /// One of the databases was not ready; nothing was attempted.
    Skipped,
    Collected { cumulative: u64, incremental: u64 },
    /// The tick failed part way; the error has been logged.
    Failed,
}

impl CollectOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Collected { .. } => "collected",
            Self::Failed => "failed",
        }
    }
}

/// Collector for a single tick, built from the profile settings current at
/// the start of the tick.
pub struct StatementsCollector {
    profile: Profile,
    connector: Arc<dyn Connector>,
    monitored: MonitoredDatabaseProbe,
    report: ReportDatabaseProbe,
}

impl StatementsCollector {
    pub fn new(profile: &Profile, connector: Arc<dyn Connector>) -> Self {
        Self {
            profile: profile.clone(),
            connector,
            monitored: MonitoredDatabaseProbe::new(),
            report: ReportDatabaseProbe::new(),
        }
    }

    /// Statuses observed by the last call to [`Self::collect`].
    pub const fn statuses(&self) -> (MonitoredDbStatus, ReportDbStatus) {
        (self.monitored.status(), self.report.status())
    }

    pub async fn collect(&mut self) -> CollectOutcome {
        self.collect_at(Utc::now()).await
    }

    /// Run one tick as if the clock read `now`. Errors never escape: they
    /// are logged and reported as [`CollectOutcome::Failed`].
    #[instrument(skip(self, now), level = "info", fields(profile = %self.profile.name))]
    pub async fn collect_at(&mut self, now: DateTime<Utc>) -> CollectOutcome {
        let outcome = match self.open_sessions().await {
            None => CollectOutcome::Skipped,
            Some((mut monitored, mut report)) => {
                let result = self
                    .run_tick(SnapshotKey::at(now), monitored.as_mut(), report.as_mut())
                    .instrument(info_span!("collect.tick"))
                    .await;

                close_sessions(monitored, report).await;

                match result {
                    Ok((cumulative, incremental)) => CollectOutcome::Collected {
                        cumulative,
                        incremental,
                    },
                    Err(e) => {
                        warn!(profile = %self.profile.name, error = %format!("{e:#}"), "collection failed");
                        CollectOutcome::Failed
                    }
                }
            }
        };

        metrics::COLLECT_TICKS
            .with_label_values(&[self.profile.name.as_str(), outcome.as_str()])
            .inc();

        outcome
    }

    async fn open_sessions(
        &mut self,
    ) -> Option<(Box<dyn MonitoredSession>, Box<dyn ReportSession>)> {
        let connector = self.connector.as_ref();
        let monitored_conn: &Connection = &self.profile.monitored_connection;
        let report_conn: &Connection = &self.profile.report_connection;

        let monitored = self.monitored.open(connector, monitored_conn).await;
        let report = self.report.open(connector, report_conn).await;

        match (monitored, report) {
            (Some(monitored), Some(report)) => Some((monitored, report)),
            (monitored, report) => {
                debug!(
                    profile = %self.profile.name,
                    monitordbstatus = %self.monitored.status(),
                    reportdbstatus = %self.report.status(),
                    "databases not ready, skipping tick"
                );
                close_sessions_opt(monitored, report).await;
                None
            }
        }
    }

    async fn run_tick(
        &self,
        key: SnapshotKey,
        monitored: &mut dyn MonitoredSession,
        report: &mut dyn ReportSession,
    ) -> Result<(u64, u64)> {
        let name = self.profile.name.as_str();

        let cipher = self
            .profile
            .cipher()
            .context("Failed to derive query cipher")?;

        let stats = monitored
            .fetch_statements()
            .await
            .context("Failed to read pg_stat_statements")?;

        let rows = stats
            .into_iter()
            .map(|s| StatementRow::cumulative(name, key, s, cipher.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to encrypt query text")?;

        let cumulative = report
            .replace_cumulative(name, key, &rows)
            .await
            .context("Failed to insert cumulative rows")?;

        metrics::ROWS_INSERTED
            .with_label_values(&[name, CUMULATIVE_TABLE])
            .inc_by(cumulative);

        let snapshots = report
            .latest_snapshots(name)
            .await
            .context("Failed to read latest cumulative snapshots")?;

        // only a delta ending at this tick belongs to this tick
        let deltas: Vec<StatementRow> = incremental::compute(&snapshots)
            .into_iter()
            .filter(|row| row.result_epoch == key.epoch)
            .collect();

        let incremental = report
            .replace_incremental(name, key, &deltas)
            .await
            .context("Failed to insert incremental rows")?;

        metrics::ROWS_INSERTED
            .with_label_values(&[name, INCREMENTAL_TABLE])
            .inc_by(incremental);

        debug!(
            profile = %name,
            result_epoch = key.epoch,
            cumulative,
            incremental,
            "snapshot stored"
        );

        Ok((cumulative, incremental))
    }
}

async fn close_sessions(monitored: Box<dyn MonitoredSession>, report: Box<dyn ReportSession>) {
    close_sessions_opt(Some(monitored), Some(report)).await;
}

async fn close_sessions_opt(
    monitored: Option<Box<dyn MonitoredSession>>,
    report: Option<Box<dyn ReportSession>>,
) {
    if let Some(session) = monitored
        && let Err(e) = session.close().await
    {
        debug!(error = %e, "failed to close monitored session");
    }

    if let Some(session) = report
        && let Err(e) = session.close().await
    {
        debug!(error = %e, "failed to close report session");
    }
}
