#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use iox_time::{MockProvider, Time};
use metric::Registry;
use shardkeeper::{ShardingContext, ShardingContextArgs};
use shardkeeper_catalog::{
    CatalogStore, CatalogWriteOp, ChunkEntry, ChunkRange, CollectionCatalogEntry,
    IndexCatalogEntry, MemCatalogStore,
};
use shardkeeper_ddl::{DdlArgs, InMemoryShards, RecoveryState};
use shardkeeper_types::{
    ChunkVersion, CollectionGeneration, CollectionUuid, Document, KeyPart, NamespaceString,
    ShardId, ShardKeyPattern, ShardKeyValue, Timestamp, WriteConcern,
};
use uuid::Uuid;

/// A two shard cluster, `s0` and `s1`, seen from the context of one of them.
pub(crate) struct Cluster {
    pub(crate) ctx: ShardingContext,
    pub(crate) store: Arc<MemCatalogStore>,
    pub(crate) shards: Arc<InMemoryShards>,
    pub(crate) time_provider: Arc<MockProvider>,
    pub(crate) metric_registry: Arc<Registry>,
}

pub(crate) fn cluster(this_shard: &str) -> Cluster {
    let store = Arc::new(MemCatalogStore::new());
    let shards = Arc::new(InMemoryShards::new([ShardId::new("s0"), ShardId::new("s1")]));
    let time_provider = Arc::new(MockProvider::new(Time::from_timestamp(1_000, 0).unwrap()));
    let metric_registry = Arc::new(Registry::new());
    let ctx = ShardingContext::new(ShardingContextArgs {
        shard_id: ShardId::new(this_shard),
        initial_term: 1,
        ddl: DdlArgs {
            lock_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        },
        max_buffered_ops: 100,
        store: Arc::<MemCatalogStore>::clone(&store),
        shards: Arc::<InMemoryShards>::clone(&shards),
        time_provider: Arc::<MockProvider>::clone(&time_provider),
        metric_registry: Arc::clone(&metric_registry),
    });
    Cluster {
        ctx,
        store,
        shards,
        time_provider,
        metric_registry,
    }
}

/// Step up in `term` and wait for DDL recovery to finish.
pub(crate) async fn step_up(c: &Cluster, term: i64) {
    c.ctx.step_up(term);
    tokio::time::timeout(Duration::from_secs(5), async {
        while c.ctx.recovery_state() != RecoveryState::Recovered {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

pub(crate) fn key(v: i64) -> ShardKeyValue {
    ShardKeyValue::new([KeyPart::Int(v)])
}

pub(crate) fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

/// Shard `nss` on `x`: `[MinKey, 0)` lives on s0. `[0, MaxKey)` was created on s0 and moved to
/// s1 at `moved_at`.
pub(crate) async fn shard_collection(
    c: &Cluster,
    nss: &NamespaceString,
    moved_at: Timestamp,
) -> CollectionCatalogEntry {
    let pattern = ShardKeyPattern::new(["x"]).unwrap();
    let created = Timestamp::new(10, 0);
    let generation = CollectionGeneration::new(Uuid::new_v4(), created);
    let entry = CollectionCatalogEntry::new(
        nss.clone(),
        CollectionUuid::new(),
        pattern.clone(),
        generation,
    );
    let chunks = vec![
        ChunkEntry::new(
            entry.uuid,
            ChunkRange::new(pattern.global_min(), key(0)),
            ShardId::new("s0"),
            ChunkVersion::new(generation, 1, 0),
            created,
        ),
        ChunkEntry::new(
            entry.uuid,
            ChunkRange::new(key(0), pattern.global_max()),
            ShardId::new("s0"),
            ChunkVersion::new(generation, 1, 1),
            created,
        )
        .moved_to(
            ShardId::new("s1"),
            moved_at,
            ChunkVersion::new(generation, 2, 0),
        ),
    ];
    for op in [
        CatalogWriteOp::InsertCollection(entry.clone()),
        CatalogWriteOp::InsertChunks(chunks),
        CatalogWriteOp::InsertIndexEntries(vec![IndexCatalogEntry {
            collection_uuid: entry.uuid,
            name: "x_1".to_string(),
            key_fields: vec!["x".to_string()],
        }]),
    ] {
        c.store.write(op, WriteConcern::Majority).await.unwrap();
    }
    for shard in [ShardId::new("s0"), ShardId::new("s1")] {
        c.shards
            .create_collection(&shard, nss.clone(), entry.uuid)
            .unwrap();
    }
    entry
}
