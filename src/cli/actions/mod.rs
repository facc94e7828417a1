pub mod init_schema;
pub mod run;

use crate::supervisor::{LogFileConfig, LogQueue};
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

/// Everything `run` needs, resolved and checked by the dispatcher.
#[derive(Debug)]
pub struct RunConfig {
    pub port: u16,
    pub listen: Option<String>,
    /// `<base>/resources/sec`, holds the sealed profile and key files.
    pub security_dir: PathBuf,
    pub log_file: LogFileConfig,
    pub config_secret: SecretString,
    pub apikeygen_secret: SecretString,
    pub collect_interval: Duration,
    pub check_interval: Duration,
}

#[derive(Debug)]
pub enum Action {
    Run {
        config: RunConfig,
        log_queue: LogQueue,
    },
    InitSchema {
        dsn: SecretString,
    },
}
