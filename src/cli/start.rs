use crate::cli::{actions::Action, commands, dispatch::handler, telemetry};
use crate::supervisor::{LogQueue, logsink::DEFAULT_QUEUE_CAPACITY};
use anyhow::Result;

/// Map verbosity count to tracing level
const fn get_verbosity_level(verbose_count: u8) -> Option<tracing::Level> {
    match verbose_count {
        0 => None,
        1 => Some(tracing::Level::INFO),
        2 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Start the CLI
///
/// # Errors
///
/// Returns an error if telemetry initialization or command handling fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let verbosity_level = get_verbosity_level(matches.get_count("verbose"));

    // the server also writes its log file, init-schema only the terminal
    let log_queue = LogQueue::bounded(DEFAULT_QUEUE_CAPACITY);
    let file_logging = matches.subcommand().is_none().then(|| log_queue.clone());

    telemetry::init(verbosity_level, file_logging)?;

    let action = handler(&matches, &log_queue)?;

    Ok(action)
}
