use crate::api::GIT_COMMIT_HASH;
use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("pg_stat_profiler")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(GIT_COMMIT_HASH)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port for the profile API")
                .default_value("8443")
                .env("PG_STAT_PROFILER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("IP address to bind, defaults to [::] falling back to 0.0.0.0")
                .env("PG_STAT_PROFILER_LISTEN")
                .value_name("IP"),
        )
        .arg(
            Arg::new("base")
                .long("base")
                .help("Installation base; sealed files live in <base>/resources/sec")
                .env("PG_STAT_PROFILER_BASE")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .help("Directory of the rotated pg-stat-profiler.log")
                .env("PG_STAT_PROFILER_LOGBASE")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("config-secret")
                .long("config-secret")
                .help("Secret sealing the profile registry and keystore")
                .env("PG_STAT_PROFILER_CONFIG_SECRET")
                .hide_env_values(true)
                .value_name("SECRET"),
        )
        .arg(
            Arg::new("apikeygen-secret")
                .long("apikeygen-secret")
                .help("Secret required to list or regenerate API keys")
                .env("PG_STAT_PROFILER_APIKEYGEN_SECRET")
                .hide_env_values(true)
                .value_name("SECRET"),
        )
        .arg(
            Arg::new("collect-interval")
                .long("collect-interval")
                .help("Seconds between collections of a profile")
                .default_value("60")
                .env("PG_STAT_PROFILER_COLLECT_INTERVAL")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("check-interval")
                .long("check-interval")
                .help("Seconds between supervisor health checks")
                .default_value("10")
                .env("PG_STAT_PROFILER_CHECK_INTERVAL")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("log-max-bytes")
                .long("log-max-bytes")
                .help("Rotate the log file once it reaches this size")
                .default_value("100000000")
                .env("PG_STAT_PROFILER_LOG_MAX_BYTES")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("log-backups")
                .long("log-backups")
                .help("Number of rotated log files to keep")
                .default_value("10")
                .env("PG_STAT_PROFILER_LOG_BACKUPS")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count)
                .global(true),
        )
        .subcommand(
            Command::new("init-schema")
                .about("Create the report schema and result tables")
                .arg(
                    Arg::new("dsn")
                        .long("dsn")
                        .help("Report database connection string")
                        .env("PG_STAT_PROFILER_REPORT_DSN")
                        .hide_env_values(true)
                        .required(true)
                        .value_name("DSN"),
                ),
        )
}
