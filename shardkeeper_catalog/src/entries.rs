//! Rows of the persisted catalog tables.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardkeeper_types::{
    ChunkVersion, CollectionGeneration, CollectionUuid, NamespaceString, ShardId, ShardKeyPattern,
    ShardKeyValue, Timestamp,
};

/// One sharded collection. A namespace has at most one entry, and the UUID of an entry never
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCatalogEntry {
    pub nss: NamespaceString,
    pub uuid: CollectionUuid,
    pub key_pattern: ShardKeyPattern,
    pub unique: bool,
    pub default_collation: Option<Value>,
    pub allow_migrations: bool,
    pub generation: CollectionGeneration,
}

impl CollectionCatalogEntry {
    pub fn new(
        nss: NamespaceString,
        uuid: CollectionUuid,
        key_pattern: ShardKeyPattern,
        generation: CollectionGeneration,
    ) -> Self {
        Self {
            nss,
            uuid,
            key_pattern,
            unique: false,
            default_collation: None,
            allow_migrations: true,
            generation,
        }
    }
}

/// Half-open `[min, max)` range of shard key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: ShardKeyValue,
    pub max: ShardKeyValue,
}

impl ChunkRange {
    pub fn new(min: ShardKeyValue, max: ShardKeyValue) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, key: &ShardKeyValue) -> bool {
        &self.min <= key && key < &self.max
    }
}

impl Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// The shard that became owner of a chunk at `valid_after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHistory {
    pub valid_after: Timestamp,
    pub shard: ShardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub collection_uuid: CollectionUuid,
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    /// Ownership changes, newest first. The first entry is the last-moved marker.
    pub history: Vec<ChunkHistory>,
}

impl ChunkEntry {
    /// A chunk that has been on `shard` since `created_at`.
    pub fn new(
        collection_uuid: CollectionUuid,
        range: ChunkRange,
        shard: ShardId,
        version: ChunkVersion,
        created_at: Timestamp,
    ) -> Self {
        Self {
            collection_uuid,
            range,
            history: vec![ChunkHistory {
                valid_after: created_at,
                shard: shard.clone(),
            }],
            shard,
            version,
        }
    }

    /// Record a migration to `to` that committed at `at`.
    pub fn moved_to(mut self, to: ShardId, at: Timestamp, version: ChunkVersion) -> Self {
        self.history.insert(
            0,
            ChunkHistory {
                valid_after: at,
                shard: to.clone(),
            },
        );
        self.shard = to;
        self.version = version;
        self
    }
}

/// Which shards owned a namespace from `timestamp` on. An empty shard list marks a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementHistoryEntry {
    pub nss: NamespaceString,
    pub uuid: CollectionUuid,
    pub timestamp: Timestamp,
    pub shards: Vec<ShardId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCatalogEntry {
    pub collection_uuid: CollectionUuid,
    pub name: String,
    pub key_fields: Vec<String>,
}

/// A zone: a shard key range pinned to a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub nss: NamespaceString,
    pub tag: String,
    pub range: ChunkRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalyzerEntry {
    pub nss: NamespaceString,
    pub collection_uuid: CollectionUuid,
    pub samples_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecoveryDocumentId {
    pub nss: NamespaceString,
    pub kind: String,
}

impl Display for RecoveryDocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.nss)
    }
}

/// Persisted progress of one DDL operation. The payload is owned by the coordinator kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDocument {
    pub id: RecoveryDocumentId,
    pub payload: Value,
}
