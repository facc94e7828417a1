use crate::collectors::schema;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{ConnectOptions, postgres::PgConnectOptions};
use std::str::FromStr;

/// Create the report schema on the database behind `dsn`.
pub async fn handle(dsn: SecretString) -> Result<()> {
    let opts = PgConnectOptions::from_str(dsn.expose_secret())
        .context("Invalid report database DSN")?;

    let mut conn = opts
        .connect()
        .await
        .context("Failed to connect to the report database")?;

    schema::apply(&mut conn).await?;

    println!("schema {} is ready", schema::SCHEMA);

    Ok(())
}
