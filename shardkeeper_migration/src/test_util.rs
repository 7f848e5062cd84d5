use shardkeeper_catalog::{ChunkEntry, ChunkManager, ChunkRange, CollectionCatalogEntry};
use shardkeeper_types::{
    ChunkVersion, CollectionGeneration, CollectionUuid, KeyPart, NamespaceString, ShardId,
    ShardKeyPattern, ShardKeyValue, Timestamp,
};
use uuid::Uuid;

use crate::sharding_state::CollectionMetadata;

pub(crate) fn orders_collection() -> CollectionCatalogEntry {
    CollectionCatalogEntry::new(
        NamespaceString::new("db", "orders"),
        CollectionUuid::new(),
        ShardKeyPattern::new(["x"]).unwrap(),
        CollectionGeneration::new(Uuid::new_v4(), Timestamp::new(10, 0)),
    )
}

/// `db.orders` sharded on `x`: `[MinKey, 0)` on s0 and `[0, MaxKey)` on s1, as seen by
/// `this_shard`.
pub(crate) fn two_chunk_metadata(this_shard: &str) -> CollectionMetadata {
    let coll = orders_collection();
    let split = ShardKeyValue::new([KeyPart::Int(0)]);
    let chunks = vec![
        ChunkEntry::new(
            coll.uuid,
            ChunkRange::new(coll.key_pattern.global_min(), split.clone()),
            ShardId::new("s0"),
            ChunkVersion::new(coll.generation, 2, 0),
            Timestamp::new(10, 0),
        ),
        ChunkEntry::new(
            coll.uuid,
            ChunkRange::new(split, coll.key_pattern.global_max()),
            ShardId::new("s1"),
            ChunkVersion::new(coll.generation, 2, 1),
            Timestamp::new(10, 0),
        ),
    ];
    CollectionMetadata::sharded(
        ChunkManager::new(&coll, chunks).unwrap(),
        ShardId::new(this_shard),
    )
}

pub(crate) fn doc(value: serde_json::Value) -> shardkeeper_types::Document {
    value.as_object().cloned().unwrap()
}
