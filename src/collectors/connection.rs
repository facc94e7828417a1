//! Database endpoint descriptions.
//!
//! A [`Connection`] has two presentations:
//! - the persistence-facing one (`Serialize` on `Connection` itself), which
//!   carries the password and must only ever reach the sealed profile file;
//! - the API-facing [`ConnectionView`], which has no credential field at all.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::fmt;

pub const DEFAULT_PORT: u16 = 5432;

const APPLICATION_NAME: &str = "pg_stat_profiler";

/// Rejected profile or connection payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Monitored,
    Report,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monitored => write!(f, "monitored"),
            Self::Report => write!(f, "report"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub role: ConnectionRole,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
    #[serde(with = "secret_string")]
    pub password: SecretString,
}

/// Connection fields as received from the API. Every field is optional so the
/// same shape serves both creation (where host, dbname and username are
/// required) and partial updates.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionPayload {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dbname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// API-safe projection of a [`Connection`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionView {
    pub role: ConnectionRole,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
}

impl Connection {
    /// Build a connection from a creation payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the first missing or empty field.
    pub fn from_payload(
        role: ConnectionRole,
        payload: ConnectionPayload,
    ) -> Result<Self, ValidationError> {
        let required = |value: Option<String>, field: &str| {
            value.ok_or_else(|| ValidationError::new(format!("{role}_connection.{field} is required")))
        };

        let conn = Self {
            role,
            host: required(payload.host, "host")?,
            port: payload.port.unwrap_or(DEFAULT_PORT),
            dbname: required(payload.dbname, "dbname")?,
            username: required(payload.username, "username")?,
            password: SecretString::from(payload.password.unwrap_or_default()),
        };

        conn.validate()?;

        Ok(conn)
    }

    /// Merge a partial payload in place. On error `self` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the merged connection is not valid.
    pub fn update(&mut self, payload: ConnectionPayload) -> Result<(), ValidationError> {
        let mut next = self.clone();

        if let Some(host) = payload.host {
            next.host = host;
        }
        if let Some(port) = payload.port {
            next.port = port;
        }
        if let Some(dbname) = payload.dbname {
            next.dbname = dbname;
        }
        if let Some(username) = payload.username {
            next.username = username;
        }
        if let Some(password) = payload.password {
            next.password = SecretString::from(password);
        }

        next.validate()?;
        *self = next;

        Ok(())
    }

    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty host, database or user name,
    /// or a zero port.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let role = self.role;

        for (field, value) in [
            ("host", &self.host),
            ("dbname", &self.dbname),
            ("username", &self.username),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::new(format!(
                    "{role}_connection.{field} must not be empty"
                )));
            }
        }

        if self.port == 0 {
            return Err(ValidationError::new(format!(
                "{role}_connection.port must be greater than 0"
            )));
        }

        Ok(())
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.username)
            .password(self.password.expose_secret())
            .application_name(APPLICATION_NAME)
    }

    pub fn view(&self) -> ConnectionView {
        ConnectionView::from(self)
    }

    /// Compares everything that affects how a collector connects, including
    /// the password.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.role == other.role
            && self.host == other.host
            && self.port == other.port
            && self.dbname == other.dbname
            && self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.dbname
        )
    }
}

impl From<&Connection> for ConnectionView {
    fn from(conn: &Connection) -> Self {
        Self {
            role: conn.role,
            host: conn.host.clone(),
            port: conn.port,
            dbname: conn.dbname.clone(),
            username: conn.username.clone(),
        }
    }
}

/// Serde adapter writing a [`SecretString`] in clear. Only for the sealed
/// persistence format.
pub(crate) mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
        String::deserialize(d).map(SecretString::from)
    }

    pub mod option {
        use secrecy::{ExposeSecret, SecretString};
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            secret: &Option<SecretString>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match secret {
                Some(secret) => s.serialize_some(secret.expose_secret()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<SecretString>, D::Error> {
            Option::<String>::deserialize(d).map(|v| v.map(SecretString::from))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ConnectionPayload {
        ConnectionPayload {
            host: Some("db.internal".to_string()),
            port: None,
            dbname: Some("orders".to_string()),
            username: Some("profiler".to_string()),
            password: Some("s3cret".to_string()),
        }
    }

    #[test]
    fn test_from_payload_defaults_port() {
        let conn = Connection::from_payload(ConnectionRole::Monitored, payload()).unwrap();
        assert_eq!(conn.port, DEFAULT_PORT);
        assert_eq!(conn.to_string(), "profiler@db.internal:5432/orders");
    }

    #[test]
    fn test_from_payload_missing_host() {
        let mut p = payload();
        p.host = None;
        let err = Connection::from_payload(ConnectionRole::Report, p).unwrap_err();
        assert_eq!(err.0, "report_connection.host is required");
    }

    #[test]
    fn test_from_payload_blank_dbname() {
        let mut p = payload();
        p.dbname = Some("  ".to_string());
        assert!(Connection::from_payload(ConnectionRole::Monitored, p).is_err());
    }

    #[test]
    fn test_view_has_no_password() {
        let conn = Connection::from_payload(ConnectionRole::Monitored, payload()).unwrap();
        let json = serde_json::to_value(conn.view()).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["host"], "db.internal");
        assert_eq!(json["role"], "monitored");
    }

    #[test]
    fn test_persisted_form_keeps_password() {
        let conn = Connection::from_payload(ConnectionRole::Report, payload()).unwrap();
        let json = serde_json::to_string(&conn).unwrap();
        assert!(json.contains("s3cret"));

        let back: Connection = serde_json::from_str(&json).unwrap();
        assert!(back.same_endpoint(&conn));
    }

    #[test]
    fn test_debug_redacts_password() {
        let conn = Connection::from_payload(ConnectionRole::Report, payload()).unwrap();
        assert!(!format!("{conn:?}").contains("s3cret"));
    }

    #[test]
    fn test_update_merges_and_keeps_password() {
        let mut conn = Connection::from_payload(ConnectionRole::Monitored, payload()).unwrap();
        conn.update(ConnectionPayload {
            port: Some(6432),
            ..ConnectionPayload::default()
        })
        .unwrap();

        assert_eq!(conn.port, 6432);
        assert_eq!(conn.password.expose_secret(), "s3cret");
    }

    #[test]
    fn test_update_invalid_leaves_connection_untouched() {
        let mut conn = Connection::from_payload(ConnectionRole::Monitored, payload()).unwrap();
        let err = conn.update(ConnectionPayload {
            host: Some(String::new()),
            port: Some(7000),
            ..ConnectionPayload::default()
        });

        assert!(err.is_err());
        assert_eq!(conn.host, "db.internal");
        assert_eq!(conn.port, DEFAULT_PORT);
    }

    #[test]
    fn test_unknown_payload_field_rejected() {
        let res: Result<ConnectionPayload, _> =
            serde_json::from_str(r#"{"host":"h","sslmode":"require"}"#);
        assert!(res.is_err());
    }
}
