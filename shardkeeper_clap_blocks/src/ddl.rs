//! Config for DDL coordination.

use std::time::Duration;

/// CLI config for DDL locking, recovery and coordinators.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct DdlConfig {
    /// How long a DDL operation waits for the locks it needs, including waiting for step-up
    /// recovery to finish, before failing with `LockTimeout`.
    #[clap(
        long = "ddl-lock-timeout",
        env = "SHARDKEEPER_DDL_LOCK_TIMEOUT",
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    pub lock_timeout: Duration,

    /// Perform a majority no-op write before reading recovery documents on step-up, so that no
    /// document committed by a previous primary is missed.
    #[clap(
        long = "ddl-recovery-linearize",
        env = "SHARDKEEPER_DDL_RECOVERY_LINEARIZE",
        default_value_t = true,
        action = clap::ArgAction::Set,
    )]
    pub linearize_recovery_reads: bool,

    /// Pause between two attempts of a coordinator phase that failed with a retryable error.
    #[clap(
        long = "ddl-retry-backoff",
        env = "SHARDKEEPER_DDL_RETRY_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration,
    )]
    pub retry_backoff: Duration,
}
