use crate::collectors::{Connector, StatementsCollector};
use crate::profile::{Profile, StatusUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, info};

/// Status message a worker publishes after every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub name: String,
    pub update: StatusUpdate,
}

/// Time left until the next tick boundary, measured from the worker start.
/// Keeps ticks aligned to `period` no matter how long a tick took.
pub fn next_delay(elapsed: Duration, period: Duration) -> Duration {
    if period.is_zero() {
        return Duration::ZERO;
    }

    let period_nanos = period.as_nanos();
    let into_period = elapsed.as_nanos() % period_nanos;

    // `period_nanos - into_period` is at most `period`, which fits a Duration
    Duration::from_nanos(u64::try_from(period_nanos - into_period).unwrap_or(u64::MAX))
}

/// Collect for `profile` forever, publishing statuses on `statuses`.
///
/// Never returns on its own; the supervisor aborts the task to stop it.
pub async fn run(
    profile: Profile,
    connector: Arc<dyn Connector>,
    statuses: UnboundedSender<StatusReport>,
    period: Duration,
) {
    info!(profile = %profile.name, period = ?period, "profile collector started");

    let start = Instant::now();

    loop {
        let mut collector = StatementsCollector::new(&profile, Arc::clone(&connector));
        let outcome = collector.collect().await;
        let (monitored, report) = collector.statuses();

        debug!(
            profile = %profile.name,
            outcome = outcome.as_str(),
            monitordbstatus = %monitored,
            reportdbstatus = %report,
            "tick finished"
        );

        let report = StatusReport {
            name: profile.name.clone(),
            update: StatusUpdate {
                monitor_db_status: Some(monitored),
                report_db_status: Some(report),
            },
        };

        if statuses.send(report).is_err() {
            debug!(profile = %profile.name, "status queue closed");
        }

        tokio::time::sleep(next_delay(start.elapsed(), period)).await;
    }
}
