use crate::collectors::{Connection, Connector, MonitoredSession, ReportSession};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Readiness of a monitored database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredDbStatus {
    #[default]
    Unknown,
    Unreachable,
    /// Server older than PostgreSQL 13.
    Unsupported,
    ExtensionMissing,
    InsufficientPrivilege,
    Operational,
}

/// Readiness of a report database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportDbStatus {
    #[default]
    Unknown,
    Unreachable,
    Uninitialised,
    Initialised,
}

impl fmt::Display for MonitoredDbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Unreachable => "unreachable",
            Self::Unsupported => "unsupported",
            Self::ExtensionMissing => "extension_missing",
            Self::InsufficientPrivilege => "insufficient_privilege",
            Self::Operational => "operational",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ReportDbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Unreachable => "unreachable",
            Self::Uninitialised => "uninitialised",
            Self::Initialised => "initialised",
        };
        f.write_str(s)
    }
}

/// Opens the monitored side of a tick and records how ready it is.
#[derive(Debug, Default)]
pub struct MonitoredDatabaseProbe {
    status: MonitoredDbStatus,
}

impl MonitoredDatabaseProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect and classify. The session is handed back only when the
    /// database is operational; otherwise it is closed here.
    pub async fn open(
        &mut self,
        connector: &dyn Connector,
        conn: &Connection,
    ) -> Option<Box<dyn MonitoredSession>> {
        let mut session = match connector.monitored(conn).await {
            Ok(session) => session,
            Err(e) => {
                debug!(endpoint = %conn, error = %e, "monitored database unreachable");
                self.status = MonitoredDbStatus::Unreachable;
                return None;
            }
        };

        self.status = match session.probe().await {
            Ok(status) => status,
            Err(e) => {
                debug!(endpoint = %conn, error = %e, "monitored database probe failed");
                MonitoredDbStatus::Unreachable
            }
        };

        if self.is_ready() {
            Some(session)
        } else {
            if let Err(e) = session.close().await {
                debug!(error = %e, "failed to close monitored session");
            }
            None
        }
    }

    pub const fn status(&self) -> MonitoredDbStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == MonitoredDbStatus::Operational
    }
}

/// Opens the report side of a tick and records how ready it is.
#[derive(Debug, Default)]
pub struct ReportDatabaseProbe {
    status: ReportDbStatus,
}

impl ReportDatabaseProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(
        &mut self,
        connector: &dyn Connector,
        conn: &Connection,
    ) -> Option<Box<dyn ReportSession>> {
        let mut session = match connector.report(conn).await {
            Ok(session) => session,
            Err(e) => {
                debug!(endpoint = %conn, error = %e, "report database unreachable");
                self.status = ReportDbStatus::Unreachable;
                return None;
            }
        };

        self.status = match session.probe().await {
            Ok(status) => status,
            Err(e) => {
                debug!(endpoint = %conn, error = %e, "report database probe failed");
                ReportDbStatus::Unreachable
            }
        };

        if self.is_ready() {
            Some(session)
        } else {
            if let Err(e) = session.close().await {
                debug!(error = %e, "failed to close report session");
            }
            None
        }
    }

    pub const fn status(&self) -> ReportDbStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == ReportDbStatus::Initialised
    }
}
