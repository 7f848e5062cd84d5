//! A shard server's sharding metadata layer, assembled from its parts.
//!
//! [`ShardingContext`] owns one instance of every component a shard needs: the DDL lock manager
//! and coordinator service, the sharding state of its collections and databases, and the chain of
//! observers every local write passes through. It is built once at startup and handed to whatever
//! serves requests; nothing in it is process-global.

use std::sync::Arc;

use iox_time::TimeProvider;
use metric::Registry;
use observability_deps::tracing::info;
use shardkeeper_catalog::{CatalogError, CatalogStore, ChunkManager, ChunkRange};
use shardkeeper_ddl::{
    DdlArgs, DdlCoordinatorService, DdlError, DdlLockManager, DropCollectionCoordinatorFactory,
    RecoveryState, RecoveryTracker, ShardClient, drop_collection_request,
};
use shardkeeper_migration::{
    CollectionMetadata, LocalOplog, MigrationSourceManager, MigrationWriteInterceptor,
    OpObserverRegistry, OplogObserver, ShardingStateRegistry, WriteError,
};
use shardkeeper_types::{ClusterClock, ErrorCode, NamespaceString, ReadConcern, ShardId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Catalog(e) => e.code(),
            Self::Ddl(e) => e.code(),
            Self::Write(e) => e.code(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything [`ShardingContext::new`] needs from the outside.
#[derive(Debug)]
pub struct ShardingContextArgs {
    pub shard_id: ShardId,
    /// Term stamped on log entries until the first step-up.
    pub initial_term: i64,
    pub ddl: DdlArgs,
    /// Buffer limit of each migration cloner.
    pub max_buffered_ops: usize,
    pub store: Arc<dyn CatalogStore>,
    pub shards: Arc<dyn ShardClient>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub metric_registry: Arc<Registry>,
}

#[derive(Debug)]
pub struct ShardingContext {
    shard_id: ShardId,
    store: Arc<dyn CatalogStore>,
    clock: Arc<ClusterClock>,
    ddl: Arc<DdlCoordinatorService>,
    sharding_state: Arc<ShardingStateRegistry>,
    oplog: Arc<LocalOplog>,
    observers: OpObserverRegistry,
    max_buffered_ops: usize,
    metric_registry: Arc<Registry>,
}

impl ShardingContext {
    pub fn new(args: ShardingContextArgs) -> Self {
        let ShardingContextArgs {
            shard_id,
            initial_term,
            ddl,
            max_buffered_ops,
            store,
            shards,
            time_provider,
            metric_registry,
        } = args;

        let clock = Arc::new(ClusterClock::new(Arc::clone(&time_provider)));
        let lock_manager = Arc::new(DdlLockManager::new(
            Arc::new(RecoveryTracker::new()),
            time_provider,
            &metric_registry,
        ));
        let ddl = Arc::new(
            DdlCoordinatorService::new(
                lock_manager,
                Arc::clone(&store),
                shards,
                Arc::clone(&clock),
                Arc::clone(&metric_registry),
                ddl,
            )
            .with_factory(Arc::new(DropCollectionCoordinatorFactory)),
        );

        let sharding_state = Arc::new(ShardingStateRegistry::new(shard_id.clone()));
        let oplog = Arc::new(LocalOplog::new(initial_term, Arc::clone(&clock)));

        // the oplog observer assigns op times and must run first
        let mut observers = OpObserverRegistry::new();
        observers.add_observer(Arc::new(OplogObserver::new(
            Arc::<LocalOplog>::clone(&oplog),
            Arc::clone(&sharding_state),
        )));
        observers.add_observer(Arc::new(MigrationWriteInterceptor::new(Arc::clone(
            &sharding_state,
        ))));

        Self {
            shard_id,
            store,
            clock,
            ddl,
            sharding_state,
            oplog,
            observers,
            max_buffered_ops,
            metric_registry,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn clock(&self) -> &Arc<ClusterClock> {
        &self.clock
    }

    pub fn metric_registry(&self) -> &Arc<Registry> {
        &self.metric_registry
    }

    pub fn ddl(&self) -> &Arc<DdlCoordinatorService> {
        &self.ddl
    }

    pub fn lock_manager(&self) -> &Arc<DdlLockManager> {
        self.ddl.lock_manager()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.ddl.recovery_state()
    }

    pub fn sharding_state(&self) -> &Arc<ShardingStateRegistry> {
        &self.sharding_state
    }

    /// The observers every local write must be reported to, in order.
    pub fn observers(&self) -> &OpObserverRegistry {
        &self.observers
    }

    pub fn oplog(&self) -> &Arc<LocalOplog> {
        &self.oplog
    }

    /// Become primary in `term`. DDL operations block until the coordinators left by previous
    /// primaries have been rebuilt.
    pub fn step_up(&self, term: i64) {
        info!(shard = %self.shard_id, term, "stepping up");
        self.oplog.set_term(term);
        self.ddl.step_up(term);
    }

    pub fn step_down(&self) {
        info!(shard = %self.shard_id, "stepping down");
        self.ddl.step_down();
    }

    /// Drop `nss` cluster-wide and wait for the drop to finish. Joins a drop of the same
    /// collection that is already running.
    pub async fn drop_collection(&self, nss: NamespaceString) -> Result<()> {
        let handle = self
            .ddl
            .get_or_create_instance(drop_collection_request(nss))
            .await?;
        handle.completion().await?;
        Ok(())
    }

    /// Reload the filtering metadata of `nss` from the sharding catalog. A collection absent from
    /// the catalog is unsharded.
    pub async fn refresh_filtering_metadata(&self, nss: &NamespaceString) -> Result<()> {
        let runtime = self.sharding_state.collection(nss);
        let metadata = match self
            .store
            .find_collection(nss, ReadConcern::Majority)
            .await?
        {
            Some(collection) => {
                let chunks = self
                    .store
                    .chunks(collection.uuid, ReadConcern::Majority)
                    .await?;
                CollectionMetadata::sharded(
                    ChunkManager::new(&collection, chunks)?,
                    self.shard_id.clone(),
                )
            }
            None => CollectionMetadata::unsharded(self.shard_id.clone()),
        };
        info!(
            %nss,
            sharded = metadata.is_sharded(),
            version = %metadata.shard_version(),
            "refreshed filtering metadata"
        );
        runtime.set_filtering_metadata(metadata);
        Ok(())
    }

    /// Start donating the chunk `range` of `nss` to `destination`. Writes to the chunk are
    /// mirrored to the returned manager's cloner until it is committed or dropped.
    pub fn start_migration(
        &self,
        nss: &NamespaceString,
        destination: ShardId,
        range: ChunkRange,
    ) -> Result<MigrationSourceManager> {
        Ok(MigrationSourceManager::start(
            self.sharding_state.collection(nss),
            destination,
            range,
            self.max_buffered_ops,
        )?)
    }
}
