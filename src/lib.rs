//! Periodic `pg_stat_statements` profiling: collect cumulative statement
//! statistics from monitored PostgreSQL databases, derive per-interval
//! deltas and store both in a report database, managed over an HTTP API.

pub mod api;
pub mod cli;
pub mod collectors;
pub mod metrics;
pub mod profile;
pub mod store;
pub mod supervisor;
