//! Building blocks shared by DDL coordinators.

use futures::future::try_join_all;
use metric::Registry;
use observability_deps::tracing::info;
use serde_json::{Value, json};
use shardkeeper_catalog::{
    CatalogError, CatalogStore, CatalogWriteOp, CollectionCatalogEntry,
    DeleteCollectionTransaction, QueryAnalyzerFilter, run_retryable_write,
    run_transaction_on_sharding_catalog,
};
use shardkeeper_types::{
    ClusterClock, CollectionUuid, NamespaceString, OperationSessionInfo, ReadConcern, ShardId,
    ShardKeyPattern, StmtId, WriteConcern, namespace::MAX_NS_SHARDED_COLLECTION_LEN,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DdlError, Result},
    participants::ShardClient,
};

/// Result of changing the allow-migrations flag of a collection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllowMigrationsOutcome {
    Updated,
    /// The collection is not sharded (any more) or was recreated with another uuid, there was
    /// nothing to update.
    NotApplicable,
}

/// Set the allow-migrations flag of `nss` if it is still the collection with `expected_uuid`.
pub async fn set_allow_migrations(
    store: &dyn CatalogStore,
    nss: &NamespaceString,
    expected_uuid: Option<CollectionUuid>,
    allow: bool,
) -> Result<AllowMigrationsOutcome> {
    let op = CatalogWriteOp::UpdateAllowMigrations {
        nss: nss.clone(),
        expected_uuid,
        allow,
    };
    match store.write(op, WriteConcern::Majority).await {
        Ok(_) => Ok(AllowMigrationsOutcome::Updated),
        Err(e @ CatalogError::NamespaceNotSharded(_))
        | Err(e @ CatalogError::ConflictingOperation { .. }) => {
            info!(%nss, allow, reason = %e, "allow migrations flag not applicable");
            Ok(AllowMigrationsOutcome::NotApplicable)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn stop_migrations(
    store: &dyn CatalogStore,
    nss: &NamespaceString,
    expected_uuid: Option<CollectionUuid>,
) -> Result<AllowMigrationsOutcome> {
    set_allow_migrations(store, nss, expected_uuid, false).await
}

pub async fn resume_migrations(
    store: &dyn CatalogStore,
    nss: &NamespaceString,
    expected_uuid: Option<CollectionUuid>,
) -> Result<AllowMigrationsOutcome> {
    set_allow_migrations(store, nss, expected_uuid, true).await
}

/// Read the allow-migrations flag with majority read concern.
pub async fn check_allow_migrations(
    store: &dyn CatalogStore,
    nss: &NamespaceString,
) -> Result<bool> {
    store
        .find_collection(nss, ReadConcern::Majority)
        .await?
        .map(|c| c.allow_migrations)
        .ok_or_else(|| DdlError::NamespaceNotFound(nss.clone()))
}

/// Delete the catalog entry, chunks and index catalog of a collection, in that order.
///
/// The entry delete and the placement history insert run as one transaction on `osi`; chunks and
/// index entries are deleted afterwards so no reader ever sees chunks without their collection.
pub async fn remove_coll_and_chunks_metadata(
    store: &dyn CatalogStore,
    clock: &ClusterClock,
    metric_registry: &Registry,
    nss: &NamespaceString,
    uuid: CollectionUuid,
    osi: OperationSessionInfo,
    cancel: &CancellationToken,
) -> Result<()> {
    let chain = DeleteCollectionTransaction::new(nss.clone(), uuid, clock.tick(), metric_registry);
    run_transaction_on_sharding_catalog(store, &chain, osi, WriteConcern::Majority, cancel).await?;

    let chunks = store
        .write(CatalogWriteOp::DeleteChunks { uuid }, WriteConcern::Majority)
        .await?;
    let indexes = store
        .write(
            CatalogWriteOp::DeleteIndexEntries { uuid },
            WriteConcern::Majority,
        )
        .await?;
    info!(
        %nss,
        %uuid,
        chunks = chunks.n,
        index_entries = indexes.n,
        "removed collection and chunks metadata"
    );
    Ok(())
}

/// Delete the zones of `nss` as a retryable write.
pub async fn remove_tags_metadata(
    store: &dyn CatalogStore,
    nss: &NamespaceString,
    osi: OperationSessionInfo,
) -> Result<()> {
    let res = run_retryable_write(
        store,
        CatalogWriteOp::DeleteTags { nss: nss.clone() },
        osi,
        StmtId::new(0),
        WriteConcern::Majority,
    )
    .await?;
    info!(%nss, n = res.n, "removed tags metadata");
    Ok(())
}

pub async fn remove_query_analyzer_metadata(
    store: &dyn CatalogStore,
    filter: QueryAnalyzerFilter,
) -> Result<()> {
    let res = store
        .write(
            CatalogWriteOp::DeleteQueryAnalyzers(filter.clone()),
            WriteConcern::Majority,
        )
        .await?;
    info!(?filter, n = res.n, "removed query analyzer metadata");
    Ok(())
}

/// Tell every shard in `shard_ids` to drop its local copy of `nss`.
pub async fn send_drop_collection_participant(
    shards: &dyn ShardClient,
    nss: &NamespaceString,
    shard_ids: &[ShardId],
    osi: OperationSessionInfo,
    from_migrate: bool,
) -> Result<()> {
    try_join_all(
        shard_ids
            .iter()
            .map(|shard| shards.drop_collection_participant(shard, nss, osi, from_migrate)),
    )
    .await?;
    Ok(())
}

/// Fail with [`DdlError::InvalidUuid`] naming every shard where `nss` exists with a uuid other
/// than `expected`.
pub async fn check_collection_uuid_consistency_across_shards(
    shards: &dyn ShardClient,
    nss: &NamespaceString,
    expected: CollectionUuid,
    shard_ids: &[ShardId],
) -> Result<()> {
    let uuids = try_join_all(
        shard_ids
            .iter()
            .map(|shard| shards.list_collection_uuid(shard, nss)),
    )
    .await?;
    let mismatching: Vec<ShardId> = shard_ids
        .iter()
        .zip(uuids)
        .filter(|(_, uuid)| uuid.is_some_and(|u| u != expected))
        .map(|(shard, _)| shard.clone())
        .collect();
    if mismatching.is_empty() {
        Ok(())
    } else {
        Err(DdlError::InvalidUuid {
            nss: nss.clone(),
            shards: mismatching,
        })
    }
}

/// Fail with [`DdlError::NamespaceExists`] naming every shard that has a local `nss`.
pub async fn check_target_collection_does_not_exist_in_cluster(
    shards: &dyn ShardClient,
    nss: &NamespaceString,
    shard_ids: &[ShardId],
) -> Result<()> {
    let uuids = try_join_all(
        shard_ids
            .iter()
            .map(|shard| shards.list_collection_uuid(shard, nss)),
    )
    .await?;
    let existing: Vec<ShardId> = shard_ids
        .iter()
        .zip(uuids)
        .filter(|(_, uuid)| uuid.is_some())
        .map(|(shard, _)| shard.clone())
        .collect();
    if existing.is_empty() {
        Ok(())
    } else {
        Err(DdlError::NamespaceExists {
            nss: nss.clone(),
            shards: existing,
        })
    }
}

pub async fn check_rename_preconditions(
    store: &dyn CatalogStore,
    shards: &dyn ShardClient,
    source_is_sharded: bool,
    to_nss: &NamespaceString,
    drop_target: bool,
) -> Result<()> {
    if source_is_sharded && to_nss.size() > MAX_NS_SHARDED_COLLECTION_LEN {
        return Err(DdlError::InvalidNamespace(format!(
            "namespace of target collection too long, {to_nss} is {} characters but the \
            limit for sharded collections is {MAX_NS_SHARDED_COLLECTION_LEN}",
            to_nss.size()
        )));
    }

    if !drop_target {
        if store
            .find_collection(to_nss, ReadConcern::Local)
            .await?
            .is_some()
        {
            return Err(DdlError::NamespaceExists {
                nss: to_nss.clone(),
                shards: vec![],
            });
        }
        if let Some(primary) = shards.database_primary(to_nss.db_name()).await? {
            if shards.list_collection_uuid(&primary, to_nss).await?.is_some() {
                return Err(DdlError::NamespaceExists {
                    nss: to_nss.clone(),
                    shards: vec![primary],
                });
            }
        }
    }

    if !store.tags(to_nss, ReadConcern::Local).await?.is_empty() {
        return Err(DdlError::CommandFailed(format!(
            "cannot rename to {to_nss} because it has associated tags"
        )));
    }
    Ok(())
}

pub async fn check_db_primaries_on_the_same_shard(
    shards: &dyn ShardClient,
    from_nss: &NamespaceString,
    to_nss: &NamespaceString,
) -> Result<()> {
    let from = shards.database_primary(from_nss.db_name()).await?;
    let to = shards.database_primary(to_nss.db_name()).await?;
    match (from, to) {
        (Some(from), Some(to)) if from == to => Ok(()),
        (from, to) => Err(DdlError::CommandFailed(format!(
            "source and destination collections must be on the same database primary, \
            {from_nss} is on {from:?} and {to_nss} is on {to:?}"
        ))),
    }
}

/// Return the existing entry if `nss` is already sharded with exactly these options, `None` if
/// it is not sharded.
pub async fn check_if_collection_already_sharded(
    store: &dyn CatalogStore,
    nss: &NamespaceString,
    key_pattern: &ShardKeyPattern,
    default_collation: Option<&Value>,
    unique: bool,
) -> Result<Option<CollectionCatalogEntry>> {
    let Some(existing) = store.find_collection(nss, ReadConcern::Majority).await? else {
        return Ok(None);
    };
    if &existing.key_pattern == key_pattern
        && existing.default_collation.as_ref() == default_collation
        && existing.unique == unique
    {
        Ok(Some(existing))
    } else {
        Err(DdlError::CommandFailed(format!(
            "sharding already enabled for {nss} with different options: shard key {}, \
            unique {}",
            existing.key_pattern, existing.unique
        )))
    }
}

/// Bump the session's transaction number on every shard in `shard_ids`, invalidating anything
/// issued with an older number.
pub async fn perform_noop_retryable_write_on_shards(
    shards: &dyn ShardClient,
    shard_ids: &[ShardId],
    osi: OperationSessionInfo,
) -> Result<()> {
    try_join_all(
        shard_ids
            .iter()
            .map(|shard| shards.noop_retryable_write(shard, osi)),
    )
    .await?;
    Ok(())
}

/// Majority write to the catalog, after which majority reads observe everything committed by a
/// previous primary.
pub async fn linearize_catalog_reads(store: &dyn CatalogStore) -> Result<()> {
    store
        .write(CatalogWriteOp::NoopWrite, WriteConcern::Majority)
        .await?;
    Ok(())
}

pub fn critical_section_reason_for_rename(
    from: &NamespaceString,
    to: &NamespaceString,
) -> Value {
    json!({
        "command": "rename",
        "from": from.to_string(),
        "to": to.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use iox_time::{MockProvider, Time};
    use pretty_assertions::assert_eq;
    use shardkeeper_catalog::{ChunkRange, MemCatalogStore, TagEntry};
    use shardkeeper_types::{CollectionGeneration, DatabaseName, ErrorCode, Timestamp};
    use uuid::Uuid;

    use super::*;
    use crate::participants::InMemoryShards;

    fn entry(nss: NamespaceString) -> CollectionCatalogEntry {
        CollectionCatalogEntry::new(
            nss,
            CollectionUuid::new(),
            ShardKeyPattern::new(["customerId"]).unwrap(),
            CollectionGeneration::new(Uuid::new_v4(), Timestamp::new(1, 1)),
        )
    }

    async fn insert(store: &MemCatalogStore, entry: &CollectionCatalogEntry) {
        store
            .write(
                CatalogWriteOp::InsertCollection(entry.clone()),
                WriteConcern::Majority,
            )
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn allow_migrations_round_trip() {
        let store = MemCatalogStore::new();
        let orders = entry(NamespaceString::new("db", "orders"));
        insert(&store, &orders).await;

        assert!(check_allow_migrations(&store, &orders.nss).await.unwrap());
        assert_eq!(
            AllowMigrationsOutcome::Updated,
            stop_migrations(&store, &orders.nss, Some(orders.uuid))
                .await
                .unwrap()
        );
        assert!(!check_allow_migrations(&store, &orders.nss).await.unwrap());
        resume_migrations(&store, &orders.nss, None).await.unwrap();
        assert!(check_allow_migrations(&store, &orders.nss).await.unwrap());

        // dropped and recreated under another uuid, or never sharded
        assert_eq!(
            AllowMigrationsOutcome::NotApplicable,
            stop_migrations(&store, &orders.nss, Some(CollectionUuid::new()))
                .await
                .unwrap()
        );
        let missing = NamespaceString::new("db", "missing");
        assert_eq!(
            AllowMigrationsOutcome::NotApplicable,
            stop_migrations(&store, &missing, None).await.unwrap()
        );
        assert_eq!(
            ErrorCode::NamespaceNotFound,
            check_allow_migrations(&store, &missing)
                .await
                .unwrap_err()
                .code()
        );
    }

    #[test_log::test(tokio::test)]
    async fn uuid_consistency_names_every_mismatching_shard() {
        let shard_ids: Vec<ShardId> = ["s0", "s1", "s2"].into_iter().map(ShardId::new).collect();
        let shards = InMemoryShards::new(shard_ids.clone());
        let nss = NamespaceString::new("db", "orders");
        let uuid = CollectionUuid::new();
        shards.create_collection(&shard_ids[0], nss.clone(), uuid).unwrap();
        shards
            .create_collection(&shard_ids[1], nss.clone(), CollectionUuid::new())
            .unwrap();

        match check_collection_uuid_consistency_across_shards(&shards, &nss, uuid, &shard_ids)
            .await
        {
            Err(DdlError::InvalidUuid { shards, .. }) => {
                assert_eq!(vec![ShardId::new("s1")], shards)
            }
            other => panic!("unexpected result {other:?}"),
        }

        match check_target_collection_does_not_exist_in_cluster(&shards, &nss, &shard_ids).await {
            Err(DdlError::NamespaceExists { shards, .. }) => {
                assert_eq!(vec![ShardId::new("s0"), ShardId::new("s1")], shards)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn rename_preconditions() {
        let store = MemCatalogStore::new();
        let shard = ShardId::new("s0");
        let shards = InMemoryShards::new([shard.clone()]);
        shards.set_database_primary(DatabaseName::new("db"), shard.clone());

        let long = NamespaceString::new("db", "x".repeat(MAX_NS_SHARDED_COLLECTION_LEN));
        let err = check_rename_preconditions(&store, &shards, true, &long, false)
            .await
            .unwrap_err();
        assert_eq!(ErrorCode::InvalidNamespace, err.code());
        // only sharded sources are limited
        check_rename_preconditions(&store, &shards, false, &long, false)
            .await
            .unwrap();

        let sharded_target = entry(NamespaceString::new("db", "sharded"));
        insert(&store, &sharded_target).await;
        let err = check_rename_preconditions(&store, &shards, true, &sharded_target.nss, false)
            .await
            .unwrap_err();
        assert_eq!(ErrorCode::NamespaceExists, err.code());
        check_rename_preconditions(&store, &shards, true, &sharded_target.nss, true)
            .await
            .unwrap();

        let unsharded_target = NamespaceString::new("db", "unsharded");
        shards
            .create_collection(&shard, unsharded_target.clone(), CollectionUuid::new())
            .unwrap();
        let err = check_rename_preconditions(&store, &shards, false, &unsharded_target, false)
            .await
            .unwrap_err();
        assert_eq!(ErrorCode::NamespaceExists, err.code());

        let tagged = NamespaceString::new("db", "tagged");
        let pattern = ShardKeyPattern::new(["x"]).unwrap();
        store
            .write(
                CatalogWriteOp::InsertTags(vec![TagEntry {
                    nss: tagged.clone(),
                    tag: "emea".to_string(),
                    range: ChunkRange::new(pattern.global_min(), pattern.global_max()),
                }]),
                WriteConcern::Majority,
            )
            .await
            .unwrap();
        let err = check_rename_preconditions(&store, &shards, false, &tagged, true)
            .await
            .unwrap_err();
        assert_eq!(ErrorCode::CommandFailed, err.code());
    }

    #[test_log::test(tokio::test)]
    async fn db_primaries_must_match() {
        let shards = InMemoryShards::new([ShardId::new("s0"), ShardId::new("s1")]);
        shards.set_database_primary(DatabaseName::new("a"), ShardId::new("s0"));
        shards.set_database_primary(DatabaseName::new("b"), ShardId::new("s0"));
        shards.set_database_primary(DatabaseName::new("c"), ShardId::new("s1"));
        let a = NamespaceString::new("a", "x");
        check_db_primaries_on_the_same_shard(&shards, &a, &NamespaceString::new("b", "x"))
            .await
            .unwrap();
        let err = check_db_primaries_on_the_same_shard(&shards, &a, &NamespaceString::new("c", "x"))
            .await
            .unwrap_err();
        assert_eq!(ErrorCode::CommandFailed, err.code());
    }

    #[test_log::test(tokio::test)]
    async fn already_sharded_check_compares_options() {
        let store = MemCatalogStore::new();
        let orders = entry(NamespaceString::new("db", "orders"));
        insert(&store, &orders).await;

        let found = check_if_collection_already_sharded(
            &store,
            &orders.nss,
            &orders.key_pattern,
            None,
            false,
        )
        .await
        .unwrap();
        assert_eq!(Some(orders.uuid), found.map(|e| e.uuid));

        let err = check_if_collection_already_sharded(
            &store,
            &orders.nss,
            &ShardKeyPattern::new(["other"]).unwrap(),
            None,
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(ErrorCode::CommandFailed, err.code());

        assert!(
            check_if_collection_already_sharded(
                &store,
                &NamespaceString::new("db", "new"),
                &orders.key_pattern,
                None,
                false,
            )
            .await
            .unwrap()
            .is_none()
        );
    }

    #[test_log::test(tokio::test)]
    async fn remove_metadata_deletes_everything_for_the_uuid() {
        let store = MemCatalogStore::new();
        let orders = entry(NamespaceString::new("db", "orders"));
        insert(&store, &orders).await;
        let tp = Arc::new(MockProvider::new(Time::from_timestamp(1000, 0).unwrap()));
        let clock = ClusterClock::new(tp);
        let registry = Registry::new();
        let osi = OperationSessionInfo::new(
            shardkeeper_types::SessionId::new(),
            shardkeeper_types::TxnNumber::new(1),
        );

        remove_coll_and_chunks_metadata(
            &store,
            &clock,
            &registry,
            &orders.nss,
            orders.uuid,
            osi,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(
            store
                .find_collection(&orders.nss, ReadConcern::Majority)
                .await
                .unwrap()
                .is_none()
        );
        linearize_catalog_reads(&store).await.unwrap();
        assert_eq!(1, store.noop_write_count(ReadConcern::Majority).await.unwrap());
        assert_eq!(
            json!({"command": "rename", "from": "db.a", "to": "db.b"}),
            critical_section_reason_for_rename(
                &NamespaceString::new("db", "a"),
                &NamespaceString::new("db", "b")
            )
        );
    }
}
