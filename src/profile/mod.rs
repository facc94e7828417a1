//! Profiles: a named pair of monitored and report connections plus the
//! collection policy applied to them.

use crate::collectors::connection::secret_string;
use crate::collectors::crypto::{CipherError, QueryCipher};
use crate::collectors::{
    Connection, ConnectionPayload, ConnectionRole, ConnectionView, MonitoredDbStatus,
    ReportDbStatus, ValidationError,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod worker;

pub use worker::{StatusReport, next_delay};

const MAX_NAME_LEN: usize = 63;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    Enabled,
    #[default]
    Disabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryEncryption {
    Enabled,
    #[default]
    Disabled,
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Persisted form of a profile. Carries credentials and the query secret, so
/// it is only ever serialized into the sealed registry file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub status: ProfileStatus,
    #[serde(rename = "queryencryption")]
    pub query_encryption: QueryEncryption,
    #[serde(
        rename = "queryencryptionsecret",
        default,
        skip_serializing_if = "Option::is_none",
        with = "secret_string::option"
    )]
    pub query_encryption_secret: Option<SecretString>,
    pub monitored_connection: Connection,
    pub report_connection: Connection,
    #[serde(rename = "monitordbstatus", default)]
    pub monitor_db_status: MonitoredDbStatus,
    #[serde(rename = "reportdbstatus", default)]
    pub report_db_status: ReportDbStatus,
}

/// API-facing projection of a [`Profile`]: no password, no secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileView {
    pub name: String,
    pub status: ProfileStatus,
    #[serde(rename = "queryencryption")]
    pub query_encryption: QueryEncryption,
    pub monitored_connection: ConnectionView,
    #[serde(rename = "monitordbstatus")]
    pub monitor_db_status: MonitoredDbStatus,
    pub report_connection: ConnectionView,
    #[serde(rename = "reportdbstatus")]
    pub report_db_status: ReportDbStatus,
}

/// Body of a create request.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilePayload {
    /// Optional; must match the name in the request path when present.
    pub name: Option<String>,
    pub status: Option<ProfileStatus>,
    #[serde(rename = "queryencryption")]
    pub query_encryption: Option<QueryEncryption>,
    #[serde(rename = "queryencryptionsecret")]
    pub query_encryption_secret: Option<String>,
    pub monitored_connection: ConnectionPayload,
    pub report_connection: ConnectionPayload,
}

/// Body of an update request. Absent fields keep their current value.
/// Database statuses are not accepted here, see [`StatusUpdate`].
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileUpdate {
    pub status: Option<ProfileStatus>,
    #[serde(rename = "queryencryption")]
    pub query_encryption: Option<QueryEncryption>,
    #[serde(rename = "queryencryptionsecret")]
    pub query_encryption_secret: Option<String>,
    pub monitored_connection: Option<ConnectionPayload>,
    pub report_connection: Option<ConnectionPayload>,
}

/// The only mutation workers can request: last observed database statuses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusUpdate {
    #[serde(rename = "monitordbstatus")]
    pub monitor_db_status: Option<MonitoredDbStatus>,
    #[serde(rename = "reportdbstatus")]
    pub report_db_status: Option<ReportDbStatus>,
}

/// # Errors
///
/// Returns a [`ValidationError`] unless `name` is 1 to 63 ASCII letters,
/// digits, `_` or `-`.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(format!(
            "profile name must be 1 to {MAX_NAME_LEN} characters"
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::new(
            "profile name may only contain letters, digits, '_' and '-'",
        ));
    }

    Ok(())
}

impl Profile {
    /// Build a new profile named `name` from a create payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the payload is incomplete or
    /// inconsistent.
    pub fn from_payload(name: &str, payload: ProfilePayload) -> Result<Self, ValidationError> {
        validate_name(name)?;

        if let Some(body_name) = &payload.name
            && body_name != name
        {
            return Err(ValidationError::new(format!(
                "profile name in body ({body_name}) does not match path ({name})"
            )));
        }

        let profile = Self {
            name: name.to_string(),
            status: payload.status.unwrap_or_default(),
            query_encryption: payload.query_encryption.unwrap_or_default(),
            query_encryption_secret: payload.query_encryption_secret.map(SecretString::from),
            monitored_connection: Connection::from_payload(
                ConnectionRole::Monitored,
                payload.monitored_connection,
            )?,
            report_connection: Connection::from_payload(
                ConnectionRole::Report,
                payload.report_connection,
            )?,
            monitor_db_status: MonitoredDbStatus::Unknown,
            report_db_status: ReportDbStatus::Unknown,
        };

        profile.validate()?;

        Ok(profile)
    }

    /// Merge an update. On error `self` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the merged profile is not valid.
    pub fn apply(&mut self, update: ProfileUpdate) -> Result<(), ValidationError> {
        let mut next = self.clone();

        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(query_encryption) = update.query_encryption {
            next.query_encryption = query_encryption;
        }
        // turning encryption off clears the stored secret, sending one
        // along is still an error
        if next.query_encryption == QueryEncryption::Disabled {
            next.query_encryption_secret = None;
        }
        if let Some(secret) = update.query_encryption_secret {
            next.query_encryption_secret = Some(SecretString::from(secret));
        }
        if let Some(payload) = update.monitored_connection {
            next.monitored_connection.update(payload)?;
        }
        if let Some(payload) = update.report_connection {
            next.report_connection.update(payload)?;
        }

        next.validate()?;
        *self = next;

        Ok(())
    }

    /// Record observed database statuses. Returns whether anything changed.
    pub fn apply_status(&mut self, update: StatusUpdate) -> bool {
        let before = (self.monitor_db_status, self.report_db_status);

        if let Some(status) = update.monitor_db_status {
            self.monitor_db_status = status;
        }
        if let Some(status) = update.report_db_status {
            self.report_db_status = status;
        }

        before != (self.monitor_db_status, self.report_db_status)
    }

    /// # Errors
    ///
    /// Returns a [`ValidationError`] when a connection is invalid or the
    /// encryption settings are inconsistent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;

        if self.monitored_connection.role != ConnectionRole::Monitored
            || self.report_connection.role != ConnectionRole::Report
        {
            return Err(ValidationError::new("connection roles are swapped"));
        }

        self.monitored_connection.validate()?;
        self.report_connection.validate()?;

        match (self.query_encryption, &self.query_encryption_secret) {
            (QueryEncryption::Enabled, None) => Err(ValidationError::new(
                "queryencryptionsecret is required when queryencryption is enabled",
            )),
            (QueryEncryption::Enabled, Some(secret)) => QueryCipher::from_secret(secret)
                .map(|_| ())
                .map_err(|e| ValidationError::new(format!("queryencryptionsecret: {e}"))),
            (QueryEncryption::Disabled, Some(_)) => Err(ValidationError::new(
                "queryencryptionsecret is only allowed when queryencryption is enabled",
            )),
            (QueryEncryption::Disabled, None) => Ok(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ProfileStatus::Enabled
    }

    /// Cipher for captured query text, `None` when encryption is disabled.
    ///
    /// # Errors
    ///
    /// Returns a [`CipherError`] if the stored secret cannot be used.
    pub fn cipher(&self) -> Result<Option<QueryCipher>, CipherError> {
        match (self.query_encryption, &self.query_encryption_secret) {
            (QueryEncryption::Enabled, Some(secret)) => QueryCipher::from_secret(secret).map(Some),
            (QueryEncryption::Enabled, None) => Err(CipherError::EmptySecret),
            (QueryEncryption::Disabled, _) => Ok(None),
        }
    }

    /// True when both profiles would run the same collector. Database
    /// statuses are ignored.
    pub fn settings_eq(&self, other: &Self) -> bool {
        let secret = |p: &Self| {
            p.query_encryption_secret
                .as_ref()
                .map(|s| s.expose_secret().to_string())
        };

        self.name == other.name
            && self.status == other.status
            && self.query_encryption == other.query_encryption
            && secret(self) == secret(other)
            && self
                .monitored_connection
                .same_endpoint(&other.monitored_connection)
            && self.report_connection.same_endpoint(&other.report_connection)
    }

    pub fn view(&self) -> ProfileView {
        ProfileView {
            name: self.name.clone(),
            status: self.status,
            query_encryption: self.query_encryption,
            monitored_connection: self.monitored_connection.view(),
            monitor_db_status: self.monitor_db_status,
            report_connection: self.report_connection.view(),
            report_db_status: self.report_db_status,
        }
    }
}
