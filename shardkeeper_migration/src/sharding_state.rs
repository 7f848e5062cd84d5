//! What this shard knows about the sharding of its collections and databases.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use hashbrown::HashMap;
use observability_deps::tracing::{debug, info};
use parking_lot::RwLock;
use shardkeeper_catalog::ChunkManager;
use shardkeeper_types::{
    ChunkVersion, DatabaseName, DatabaseVersion, NamespaceString, ShardId, ShardVersion,
};

use crate::{
    cloner::MigrationClonerSession,
    error::{Result, WriteError},
};

/// Filtering metadata of one collection as seen by this shard.
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    chunk_manager: Option<ChunkManager>,
    this_shard: ShardId,
}

impl CollectionMetadata {
    pub fn unsharded(this_shard: ShardId) -> Self {
        Self {
            chunk_manager: None,
            this_shard,
        }
    }

    pub fn sharded(chunk_manager: ChunkManager, this_shard: ShardId) -> Self {
        Self {
            chunk_manager: Some(chunk_manager),
            this_shard,
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.chunk_manager.is_some()
    }

    pub fn chunk_manager(&self) -> Option<&ChunkManager> {
        self.chunk_manager.as_ref()
    }

    pub fn this_shard(&self) -> &ShardId {
        &self.this_shard
    }

    /// Placement version of this shard. A shard owning no chunk of a sharded collection has
    /// version `0|0` of the collection's generation.
    pub fn shard_version(&self) -> ShardVersion {
        match &self.chunk_manager {
            None => ShardVersion::Unsharded,
            Some(cm) => ShardVersion::Sharded(
                cm.shard_version(&self.this_shard)
                    .unwrap_or_else(|| ChunkVersion::new(cm.generation(), 0, 0)),
            ),
        }
    }

    pub fn allow_migrations(&self) -> bool {
        self.chunk_manager
            .as_ref()
            .is_some_and(ChunkManager::allow_migrations)
    }
}

/// Per-collection sharding state: the filtering metadata, when known, and the cloner of the
/// migration currently donating one of its chunks.
#[derive(Debug)]
pub struct CollectionShardingRuntime {
    nss: NamespaceString,
    this_shard: ShardId,
    metadata: RwLock<Option<Arc<CollectionMetadata>>>,
    cloner: RwLock<Option<Arc<MigrationClonerSession>>>,
}

impl CollectionShardingRuntime {
    pub fn new(nss: NamespaceString, this_shard: ShardId) -> Self {
        Self {
            nss,
            this_shard,
            metadata: Default::default(),
            cloner: Default::default(),
        }
    }

    pub fn nss(&self) -> &NamespaceString {
        &self.nss
    }

    pub fn set_filtering_metadata(&self, metadata: CollectionMetadata) {
        debug!(nss = %self.nss, version = %metadata.shard_version(), "filtering metadata set");
        *self.metadata.write() = Some(Arc::new(metadata));
    }

    /// Forget the metadata, the next versioned request will have to refresh it.
    pub fn clear_filtering_metadata(&self) {
        *self.metadata.write() = None;
    }

    pub fn current_metadata_if_known(&self) -> Option<Arc<CollectionMetadata>> {
        self.metadata.read().clone()
    }

    /// Check the version a request was routed with against the metadata of this shard.
    ///
    /// Unversioned requests are always accepted and see the collection as unsharded when the
    /// metadata is unknown.
    pub fn check_shard_version_or_throw(
        &self,
        received: Option<ShardVersion>,
    ) -> Result<Arc<CollectionMetadata>> {
        let known = self.current_metadata_if_known();
        let Some(received) = received else {
            return Ok(known.unwrap_or_else(|| {
                Arc::new(CollectionMetadata::unsharded(self.this_shard.clone()))
            }));
        };

        let stale = |wanted: Option<ShardVersion>| WriteError::StaleConfig {
            nss: self.nss.clone(),
            received,
            wanted,
        };
        let Some(metadata) = known else {
            return Err(stale(None));
        };
        let wanted = metadata.shard_version();
        let compatible = match (received, wanted) {
            (ShardVersion::Unsharded, ShardVersion::Unsharded) => true,
            (ShardVersion::Sharded(received), ShardVersion::Sharded(wanted)) => {
                wanted.is_write_compatible_with(&received)
            }
            _ => false,
        };
        if compatible {
            Ok(metadata)
        } else {
            Err(stale(Some(wanted)))
        }
    }

    pub fn cloner(&self) -> Option<Arc<MigrationClonerSession>> {
        self.cloner.read().clone()
    }

    pub(crate) fn install_cloner(&self, session: Arc<MigrationClonerSession>) -> Result<()> {
        let mut cloner = self.cloner.write();
        if let Some(existing) = cloner.as_ref() {
            return Err(WriteError::ConflictingOperation(format!(
                "{} is already donating chunk {} to {}",
                self.nss,
                existing.range(),
                existing.destination_shard()
            )));
        }
        *cloner = Some(session);
        Ok(())
    }

    /// Remove `session` if it is still the installed cloner.
    pub(crate) fn remove_cloner(&self, session: &MigrationClonerSession) {
        let mut cloner = self.cloner.write();
        if cloner.as_ref().is_some_and(|c| c.id() == session.id()) {
            *cloner = None;
        }
    }
}

/// Per-database sharding state.
#[derive(Debug)]
pub struct DatabaseShardingState {
    db: DatabaseName,
    version: RwLock<Option<DatabaseVersion>>,
    move_primary_in_progress: AtomicBool,
}

impl DatabaseShardingState {
    pub fn new(db: DatabaseName) -> Self {
        Self {
            db,
            version: Default::default(),
            move_primary_in_progress: AtomicBool::new(false),
        }
    }

    pub fn set_db_version(&self, version: Option<DatabaseVersion>) {
        *self.version.write() = version;
    }

    pub fn db_version(&self) -> Option<DatabaseVersion> {
        *self.version.read()
    }

    /// Unversioned requests always match.
    pub fn assert_matching_db_version(&self, received: Option<DatabaseVersion>) -> Result<()> {
        let Some(received) = received else {
            return Ok(());
        };
        let wanted = self.db_version();
        if wanted == Some(received) {
            Ok(())
        } else {
            Err(WriteError::StaleDbVersion {
                db: self.db.clone(),
                received,
                wanted,
            })
        }
    }

    pub fn set_move_primary_in_progress(&self, in_progress: bool) {
        let previous = self
            .move_primary_in_progress
            .swap(in_progress, Ordering::SeqCst);
        if previous != in_progress {
            info!(db = %self.db, in_progress, "move primary state changed");
        }
    }

    pub fn is_move_primary_in_progress(&self) -> bool {
        self.move_primary_in_progress.load(Ordering::SeqCst)
    }
}

/// The sharding state of every collection and database on this shard.
#[derive(Debug)]
pub struct ShardingStateRegistry {
    this_shard: ShardId,
    collections: RwLock<HashMap<NamespaceString, Arc<CollectionShardingRuntime>>>,
    databases: RwLock<HashMap<DatabaseName, Arc<DatabaseShardingState>>>,
}

impl ShardingStateRegistry {
    pub fn new(this_shard: ShardId) -> Self {
        Self {
            this_shard,
            collections: Default::default(),
            databases: Default::default(),
        }
    }

    pub fn this_shard(&self) -> &ShardId {
        &self.this_shard
    }

    pub fn collection(&self, nss: &NamespaceString) -> Arc<CollectionShardingRuntime> {
        if let Some(csr) = self.collections.read().get(nss) {
            return Arc::clone(csr);
        }
        let mut collections = self.collections.write();
        Arc::clone(collections.entry(nss.clone()).or_insert_with(|| {
            Arc::new(CollectionShardingRuntime::new(
                nss.clone(),
                self.this_shard.clone(),
            ))
        }))
    }

    pub fn database(&self, db: &DatabaseName) -> Arc<DatabaseShardingState> {
        if let Some(dss) = self.databases.read().get(db) {
            return Arc::clone(dss);
        }
        let mut databases = self.databases.write();
        Arc::clone(
            databases
                .entry(db.clone())
                .or_insert_with(|| Arc::new(DatabaseShardingState::new(db.clone()))),
        )
    }
}

/// Snapshot of the sharding state a single write is routed against.
#[derive(Debug)]
pub struct ShardingWriteRouter {
    collection: Arc<CollectionShardingRuntime>,
    database: Arc<DatabaseShardingState>,
    cloner: Option<Arc<MigrationClonerSession>>,
}

impl ShardingWriteRouter {
    pub fn new(registry: &ShardingStateRegistry, nss: &NamespaceString) -> Self {
        let collection = registry.collection(nss);
        let cloner = collection.cloner();
        Self {
            database: registry.database(nss.db_name()),
            collection,
            cloner,
        }
    }

    pub fn collection(&self) -> &Arc<CollectionShardingRuntime> {
        &self.collection
    }

    pub fn database(&self) -> &Arc<DatabaseShardingState> {
        &self.database
    }

    /// Cloner of the migration in progress when the write started, if any.
    pub fn cloner(&self) -> Option<&Arc<MigrationClonerSession>> {
        self.cloner.as_ref()
    }
}
