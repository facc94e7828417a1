use crate::{
    cli::actions::{Action, RunConfig},
    supervisor::{LogFileConfig, LogQueue},
};
use anyhow::{Result, anyhow, bail};
use clap::ArgMatches;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOG_FILE_NAME: &str = "pg-stat-profiler.log";

pub fn handler(matches: &ArgMatches, log_queue: &LogQueue) -> Result<Action> {
    if let Some(("init-schema", sub)) = matches.subcommand() {
        let dsn = sub
            .get_one::<String>("dsn")
            .map(|s| SecretString::from(s.to_string()))
            .ok_or_else(|| anyhow!("DSN is required. Please provide it using the --dsn flag."))?;

        return Ok(Action::InitSchema { dsn });
    }

    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // None means auto-detect
    let listen = matches.get_one::<String>("listen").map(|s| s.to_string());

    let base = required_dir(matches, "base", "PG_STAT_PROFILER_BASE")?;
    let security_dir = base.join("resources").join("sec");
    if !security_dir.is_dir() {
        bail!(
            "Security directory {} does not exist",
            security_dir.display()
        );
    }

    let log_dir = required_dir(matches, "log-dir", "PG_STAT_PROFILER_LOGBASE")?;

    let config_secret = required_secret(matches, "config-secret", "PG_STAT_PROFILER_CONFIG_SECRET")?;
    let apikeygen_secret = required_secret(
        matches,
        "apikeygen-secret",
        "PG_STAT_PROFILER_APIKEYGEN_SECRET",
    )?;

    let seconds = |name: &str| {
        matches
            .get_one::<u64>(name)
            .copied()
            .map(Duration::from_secs)
            .ok_or_else(|| anyhow!("--{name} is required"))
    };

    let log_file = LogFileConfig {
        path: log_dir.join(LOG_FILE_NAME),
        max_bytes: matches.get_one::<u64>("log-max-bytes").copied().unwrap_or(100_000_000),
        backups: matches.get_one::<usize>("log-backups").copied().unwrap_or(10),
    };

    Ok(Action::Run {
        config: RunConfig {
            port,
            listen,
            security_dir,
            log_file,
            config_secret,
            apikeygen_secret,
            collect_interval: seconds("collect-interval")?,
            check_interval: seconds("check-interval")?,
        },
        log_queue: log_queue.clone(),
    })
}

fn required_dir(matches: &ArgMatches, name: &str, env: &str) -> Result<PathBuf> {
    let dir = matches.get_one::<String>(name).map(PathBuf::from).ok_or_else(|| {
        anyhow!("--{name} is required. Please provide it using the --{name} flag or {env}.")
    })?;

    if !Path::new(&dir).is_dir() {
        bail!("Directory {} does not exist", dir.display());
    }

    Ok(dir)
}

fn required_secret(matches: &ArgMatches, name: &str, env: &str) -> Result<SecretString> {
    let secret = matches
        .get_one::<String>(name)
        .map(|s| SecretString::from(s.to_string()))
        .ok_or_else(|| {
            anyhow!("--{name} is required. Please provide it using the --{name} flag or {env}.")
        })?;

    if secret.expose_secret().trim().is_empty() {
        bail!("--{name} must not be empty");
    }

    Ok(secret)
}
