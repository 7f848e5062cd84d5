//! Config for the donor side of chunk migrations.

/// CLI config for chunk migrations.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct MigrationConfig {
    /// Maximum number of writes a migration buffers for its destination.
    ///
    /// Writes beyond the limit are not buffered and the migration fails when it tries to commit,
    /// user writes are never rejected because of it.
    #[clap(
        long = "migration-max-buffered-ops",
        env = "SHARDKEEPER_MIGRATION_MAX_BUFFERED_OPS",
        default_value = "100000",
        action
    )]
    pub max_buffered_ops: usize,
}
