//! Run one shard's sharding layer.

use std::sync::Arc;

use iox_time::SystemProvider;
use metric::Registry;
use observability_deps::tracing::info;
use shardkeeper::{ShardingContext, ShardingContextArgs};
use shardkeeper_catalog::MemCatalogStore;
use shardkeeper_clap_blocks::{ddl::DdlConfig, migration::MigrationConfig, node::NodeConfig};
use shardkeeper_ddl::{DdlArgs, InMemoryShards};
use shardkeeper_types::ShardId;
use thiserror::Error;
use trogging::cli::LoggingConfig;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("shard {0} is not one of the cluster's shards")]
    UnknownShard(String),

    #[error("failed to wait for a shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    node_config: NodeConfig,

    #[clap(flatten)]
    ddl_config: DdlConfig,

    #[clap(flatten)]
    migration_config: MigrationConfig,

    /// Ids of every shard in the cluster, this one included.
    #[clap(
        long = "shards",
        env = "SHARDKEEPER_SHARDS",
        default_value = "shard0",
        value_delimiter = ',',
        action
    )]
    shards: Vec<String>,
}

impl Config {
    fn context_args(&self) -> Result<ShardingContextArgs> {
        let shard_id = &self.node_config.shard_id;
        if !self.shards.contains(shard_id) {
            return Err(Error::UnknownShard(shard_id.clone()));
        }
        let DdlConfig {
            lock_timeout,
            linearize_recovery_reads,
            retry_backoff,
        } = self.ddl_config;

        Ok(ShardingContextArgs {
            shard_id: ShardId::new(shard_id.as_str()),
            initial_term: self.node_config.initial_term,
            ddl: DdlArgs {
                lock_timeout,
                linearize_recovery_reads,
                retry_backoff,
            },
            max_buffered_ops: self.migration_config.max_buffered_ops,
            store: Arc::new(MemCatalogStore::new()),
            shards: Arc::new(InMemoryShards::new(
                self.shards.iter().map(|s| ShardId::new(s.as_str())),
            )),
            time_provider: Arc::new(SystemProvider::new()),
            metric_registry: Arc::new(Registry::new()),
        })
    }
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let context = ShardingContext::new(config.context_args()?);
    let term = config.node_config.initial_term;
    context.step_up(term);
    info!(
        shard = %context.shard_id(),
        term,
        shards = config.shards.len(),
        "shard started"
    );

    wait_for_signal().await.map_err(Error::Signal)?;

    context.step_down();
    info!(shard = %context.shard_id(), "shard stopped");
    Ok(())
}

/// Wait for a `SIGTERM` or `SIGINT` on UNIX systems
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` on Windows systems
#[cfg(windows)]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use shardkeeper_types::ErrorCode;

    use super::*;

    #[test]
    fn shard_must_be_part_of_the_cluster() {
        let config = Config::try_parse_from([
            "my_binary",
            "--shard-id",
            "shard1",
            "--shards",
            "shard0,shard1",
        ])
        .unwrap();
        let args = config.context_args().unwrap();
        assert_eq!(ShardId::new("shard1"), args.shard_id);

        let config =
            Config::try_parse_from(["my_binary", "--shard-id", "shard2", "--shards", "shard0"])
                .unwrap();
        assert!(matches!(config.context_args(), Err(Error::UnknownShard(s)) if s == "shard2"));
    }

    #[test_log::test(tokio::test)]
    async fn context_starts_recovered_after_step_up() {
        let config = Config::try_parse_from(["my_binary", "--initial-term", "3"]).unwrap();
        let context = ShardingContext::new(config.context_args().unwrap());
        context.step_up(3);
        context
            .lock_manager()
            .recovery()
            .wait_for_recovery_completion()
            .await
            .unwrap();
        context.step_down();
        let err = context
            .lock_manager()
            .recovery()
            .wait_for_recovery_completion()
            .await
            .unwrap_err();
        assert_eq!(ErrorCode::NotWritablePrimary, err.code());
    }
}
