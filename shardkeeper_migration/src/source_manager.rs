//! Donor side of a chunk migration.

use std::sync::Arc;

use observability_deps::tracing::info;
use shardkeeper_catalog::ChunkRange;
use shardkeeper_types::{Document, ShardId};

use crate::{
    cloner::{BufferedOp, MigrationClonerSession},
    error::{Result, WriteError},
    sharding_state::CollectionShardingRuntime,
};

/// Owns the cloner of one migration for as long as the migration runs. Dropping the manager
/// without committing aborts the migration.
#[derive(Debug)]
pub struct MigrationSourceManager {
    runtime: Arc<CollectionShardingRuntime>,
    session: Arc<MigrationClonerSession>,
}

impl MigrationSourceManager {
    /// Start donating `range` of the runtime's collection to `destination`.
    ///
    /// The collection must be sharded with migrations allowed, `range` must be exactly a chunk this
    /// shard owns, and no other migration may be in progress for the collection.
    pub fn start(
        runtime: Arc<CollectionShardingRuntime>,
        destination: ShardId,
        range: ChunkRange,
        max_buffered_ops: usize,
    ) -> Result<Self> {
        let nss = runtime.nss().clone();
        let metadata = runtime
            .current_metadata_if_known()
            .filter(|m| m.is_sharded())
            .ok_or_else(|| WriteError::NamespaceNotSharded(nss.clone()))?;
        let Some(cm) = metadata.chunk_manager() else {
            return Err(WriteError::NamespaceNotSharded(nss));
        };
        if !cm.allow_migrations() {
            return Err(WriteError::ConflictingOperation(format!(
                "migrations are not allowed for {nss}"
            )));
        }

        let this_shard = metadata.this_shard();
        if !cm
            .chunks()
            .iter()
            .any(|c| c.range == range && &c.shard == this_shard)
        {
            return Err(WriteError::CommandFailed(format!(
                "{range} is not a chunk of {nss} owned by {this_shard}"
            )));
        }
        if &destination == this_shard {
            return Err(WriteError::CommandFailed(format!(
                "cannot migrate {range} of {nss} to its current owner {destination}"
            )));
        }

        let session = Arc::new(MigrationClonerSession::new(
            cm.uuid(),
            this_shard.clone(),
            destination,
            cm.key_pattern().clone(),
            range,
            max_buffered_ops,
        ));
        runtime.install_cloner(Arc::clone(&session))?;
        info!(
            %nss,
            session = %session.id(),
            range = %session.range(),
            destination = %session.destination_shard(),
            "migration started"
        );
        Ok(Self { runtime, session })
    }

    pub fn session(&self) -> &Arc<MigrationClonerSession> {
        &self.session
    }

    /// Whether `doc` lies in the chunk being migrated.
    pub fn is_migrating(&self, doc: &Document) -> bool {
        self.session.is_document_in_migrating_chunk(doc)
    }

    /// Finish the migration, returning every write the destination must replay.
    pub fn commit(self) -> Result<Vec<BufferedOp>> {
        if self.session.is_overflowed() {
            return Err(WriteError::CommandFailed(format!(
                "migration of {} from {} dropped writes after its buffer filled up",
                self.session.range(),
                self.runtime.nss()
            )));
        }
        let ops = self.session.buffered_ops();
        info!(
            nss = %self.runtime.nss(),
            session = %self.session.id(),
            ops = ops.len(),
            "migration committed"
        );
        Ok(ops)
    }

    pub fn abort(self) {
        info!(nss = %self.runtime.nss(), session = %self.session.id(), "migration aborted");
    }
}

impl Drop for MigrationSourceManager {
    fn drop(&mut self) {
        self.runtime.remove_cloner(&self.session);
    }
}

/// Whether `doc` lies in the chunk currently being migrated out of the runtime's collection.
pub fn is_migrating(runtime: &CollectionShardingRuntime, doc: &Document) -> bool {
    match runtime.cloner() {
        Some(cloner) => cloner.is_document_in_migrating_chunk(doc),
        None => false,
    }
}
