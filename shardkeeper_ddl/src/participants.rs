//! Commands DDL coordinators send to the shards participating in an operation.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use shardkeeper_types::{
    CollectionUuid, DatabaseName, ErrorCode, NamespaceString, OperationSessionInfo, SessionId,
    ShardId, Status, TxnNumber,
};

use crate::error::{DdlError, Result};

#[async_trait]
pub trait ShardClient: Debug + Send + Sync + 'static {
    /// Every shard in the cluster.
    fn shard_ids(&self) -> Vec<ShardId>;

    /// UUID of the local collection `nss` on `shard`, if it exists there.
    async fn list_collection_uuid(
        &self,
        shard: &ShardId,
        nss: &NamespaceString,
    ) -> Result<Option<CollectionUuid>>;

    /// Drop the local collection and its sharding metadata on `shard`. Dropping an absent
    /// collection succeeds.
    async fn drop_collection_participant(
        &self,
        shard: &ShardId,
        nss: &NamespaceString,
        osi: OperationSessionInfo,
        from_migrate: bool,
    ) -> Result<()>;

    /// Drop the local collection on `shard` unless it has `expected_uuid`.
    async fn drop_collection_if_uuid_not_matching(
        &self,
        shard: &ShardId,
        nss: &NamespaceString,
        expected_uuid: CollectionUuid,
    ) -> Result<()>;

    /// Advance the transaction number of `osi`'s session on `shard` so older numbers are
    /// rejected there.
    async fn noop_retryable_write(&self, shard: &ShardId, osi: OperationSessionInfo) -> Result<()>;

    async fn database_primary(&self, db: &DatabaseName) -> Result<Option<ShardId>>;
}

/// A drop as seen by a participant shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropEvent {
    pub nss: NamespaceString,
    pub existed: bool,
    pub from_migrate: bool,
}

#[derive(Debug, Default)]
struct LocalShard {
    collections: BTreeMap<NamespaceString, CollectionUuid>,
    sessions: HashMap<SessionId, TxnNumber>,
    drops: Vec<DropEvent>,
}

impl LocalShard {
    fn check_session(&mut self, shard: &ShardId, osi: OperationSessionInfo) -> Result<()> {
        let current = self.sessions.entry(osi.session_id).or_insert(osi.txn_number);
        if *current > osi.txn_number {
            return Err(DdlError::Remote {
                shard: shard.clone(),
                status: Status::new(
                    ErrorCode::TransactionTooOld,
                    format!(
                        "txn number {} of session {} is older than {current}",
                        osi.txn_number, osi.session_id
                    ),
                ),
            });
        }
        *current = osi.txn_number;
        Ok(())
    }
}

/// Shards living in this process, each holding a set of local collections.
#[derive(Debug, Default)]
pub struct InMemoryShards {
    shards: Mutex<BTreeMap<ShardId, LocalShard>>,
    db_primaries: Mutex<HashMap<DatabaseName, ShardId>>,
}

impl InMemoryShards {
    pub fn new(shard_ids: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            shards: Mutex::new(
                shard_ids
                    .into_iter()
                    .map(|id| (id, LocalShard::default()))
                    .collect(),
            ),
            db_primaries: Default::default(),
        }
    }

    pub fn create_collection(
        &self,
        shard: &ShardId,
        nss: NamespaceString,
        uuid: CollectionUuid,
    ) -> Result<()> {
        self.with_shard(shard, |s| {
            s.collections.insert(nss, uuid);
            Ok(())
        })
    }

    pub fn set_database_primary(&self, db: DatabaseName, shard: ShardId) {
        self.db_primaries.lock().insert(db, shard);
    }

    pub fn drop_events(&self, shard: &ShardId) -> Vec<DropEvent> {
        self.with_shard(shard, |s| Ok(s.drops.clone()))
            .unwrap_or_default()
    }

    pub fn session_txn_number(&self, shard: &ShardId, session_id: SessionId) -> Option<TxnNumber> {
        self.with_shard(shard, |s| Ok(s.sessions.get(&session_id).copied()))
            .ok()
            .flatten()
    }

    fn with_shard<T>(
        &self,
        shard: &ShardId,
        f: impl FnOnce(&mut LocalShard) -> Result<T>,
    ) -> Result<T> {
        let mut shards = self.shards.lock();
        let local = shards
            .get_mut(shard)
            .ok_or_else(|| DdlError::ShardNotFound(shard.clone()))?;
        f(local)
    }
}

#[async_trait]
impl ShardClient for InMemoryShards {
    fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.lock().keys().cloned().collect()
    }

    async fn list_collection_uuid(
        &self,
        shard: &ShardId,
        nss: &NamespaceString,
    ) -> Result<Option<CollectionUuid>> {
        self.with_shard(shard, |s| Ok(s.collections.get(nss).copied()))
    }

    async fn drop_collection_participant(
        &self,
        shard: &ShardId,
        nss: &NamespaceString,
        osi: OperationSessionInfo,
        from_migrate: bool,
    ) -> Result<()> {
        self.with_shard(shard, |s| {
            s.check_session(shard, osi)?;
            let existed = s.collections.remove(nss).is_some();
            s.drops.push(DropEvent {
                nss: nss.clone(),
                existed,
                from_migrate,
            });
            debug!(%shard, %nss, existed, from_migrate, "participant dropped collection");
            Ok(())
        })
    }

    async fn drop_collection_if_uuid_not_matching(
        &self,
        shard: &ShardId,
        nss: &NamespaceString,
        expected_uuid: CollectionUuid,
    ) -> Result<()> {
        self.with_shard(shard, |s| {
            match s.collections.get(nss) {
                Some(&uuid) if uuid != expected_uuid => {
                    info!(
                        %shard,
                        %nss,
                        %uuid,
                        expected = %expected_uuid,
                        "dropping local collection with unexpected uuid"
                    );
                    s.collections.remove(nss);
                    s.drops.push(DropEvent {
                        nss: nss.clone(),
                        existed: true,
                        from_migrate: false,
                    });
                }
                _ => {}
            }
            Ok(())
        })
    }

    async fn noop_retryable_write(&self, shard: &ShardId, osi: OperationSessionInfo) -> Result<()> {
        self.with_shard(shard, |s| s.check_session(shard, osi))
    }

    async fn database_primary(&self, db: &DatabaseName) -> Result<Option<ShardId>> {
        Ok(self.db_primaries.lock().get(db).cloned())
    }
}
