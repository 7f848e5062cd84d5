//! Routing table of a sharded collection, optionally pinned to a past cluster time.

use std::sync::Arc;

use shardkeeper_types::{
    ChunkVersion, CollectionGeneration, CollectionUuid, NamespaceString, ShardId, ShardKeyPattern,
    ShardKeyValue, Timestamp,
};

use crate::{
    entries::{ChunkEntry, ChunkHistory, ChunkRange, CollectionCatalogEntry},
    error::{CatalogError, Result},
};

/// The chunks of one collection, sorted by range and covering the whole shard key space.
#[derive(Debug, Clone)]
pub struct ChunkManager {
    nss: NamespaceString,
    uuid: CollectionUuid,
    key_pattern: ShardKeyPattern,
    generation: CollectionGeneration,
    allow_migrations: bool,
    chunks: Arc<[ChunkEntry]>,
    version: ChunkVersion,
    at_cluster_time: Option<Timestamp>,
}

impl ChunkManager {
    /// Build the routing table, checking the chunks form a partition of the key space with no
    /// gaps or overlaps.
    pub fn new(collection: &CollectionCatalogEntry, mut chunks: Vec<ChunkEntry>) -> Result<Self> {
        let invalid = |reason: String| CatalogError::InvalidRoutingTable {
            nss: collection.nss.clone(),
            reason,
        };

        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
            return Err(invalid("collection has no chunks".to_string()));
        };
        if first.range.min != collection.key_pattern.global_min() {
            return Err(invalid(format!(
                "first chunk starts at {} instead of the global minimum",
                first.range.min
            )));
        }
        if last.range.max != collection.key_pattern.global_max() {
            return Err(invalid(format!(
                "last chunk ends at {} instead of the global maximum",
                last.range.max
            )));
        }
        for pair in chunks.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                return Err(invalid(format!(
                    "chunk {} is not followed by a chunk starting at its upper bound but by {}",
                    pair[0].range, pair[1].range
                )));
            }
        }

        let mut version = first.version;
        for chunk in &chunks {
            if chunk.range.min >= chunk.range.max {
                return Err(invalid(format!("chunk {} is empty", chunk.range)));
            }
            if chunk.collection_uuid != collection.uuid {
                return Err(invalid(format!(
                    "chunk {} belongs to collection {}",
                    chunk.range, chunk.collection_uuid
                )));
            }
            if chunk.version.generation != collection.generation {
                return Err(invalid(format!(
                    "chunk {} has version {} from another generation",
                    chunk.range, chunk.version
                )));
            }
            if chunk.history.is_empty() {
                return Err(invalid(format!("chunk {} has no history", chunk.range)));
            }
            if version.is_older_than(&chunk.version) {
                version = chunk.version;
            }
        }

        Ok(Self {
            nss: collection.nss.clone(),
            uuid: collection.uuid,
            key_pattern: collection.key_pattern.clone(),
            generation: collection.generation,
            allow_migrations: collection.allow_migrations,
            chunks: chunks.into(),
            version,
            at_cluster_time: None,
        })
    }

    /// A view of this routing table that answers ownership questions as of `at`.
    pub fn make_at_time(&self, at: Timestamp) -> Self {
        Self {
            at_cluster_time: Some(at),
            ..self.clone()
        }
    }

    pub fn nss(&self) -> &NamespaceString {
        &self.nss
    }

    pub fn uuid(&self) -> CollectionUuid {
        self.uuid
    }

    pub fn key_pattern(&self) -> &ShardKeyPattern {
        &self.key_pattern
    }

    pub fn generation(&self) -> CollectionGeneration {
        self.generation
    }

    pub fn allow_migrations(&self) -> bool {
        self.allow_migrations
    }

    /// Collection version: the highest chunk version.
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    pub fn at_cluster_time(&self) -> Option<Timestamp> {
        self.at_cluster_time
    }

    pub fn chunks(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    /// Highest version among the chunks currently owned by `shard`.
    pub fn shard_version(&self, shard: &ShardId) -> Option<ChunkVersion> {
        self.chunks
            .iter()
            .filter(|c| &c.shard == shard)
            .map(|c| c.version)
            .reduce(|a, b| if a.is_older_than(&b) { b } else { a })
    }

    /// Find the chunk containing `key`. Shard keys never use a collation, values compare by their
    /// canonical order only.
    pub fn find_intersecting_chunk_with_simple_collation(
        &self,
        key: &ShardKeyValue,
    ) -> Result<ChunkInfo<'_>> {
        let idx = self.chunks.partition_point(|c| &c.range.max <= key);
        match self.chunks.get(idx) {
            Some(chunk) if chunk.range.contains(key) => Ok(ChunkInfo {
                chunk,
                key: key.clone(),
                at: self.at_cluster_time,
            }),
            _ => Err(CatalogError::InvalidRoutingTable {
                nss: self.nss.clone(),
                reason: format!("no chunk contains {key}"),
            }),
        }
    }
}

/// A chunk looked up through a [`ChunkManager`], remembering the cluster time of the lookup.
#[derive(Debug)]
pub struct ChunkInfo<'a> {
    chunk: &'a ChunkEntry,
    key: ShardKeyValue,
    at: Option<Timestamp>,
}

impl ChunkInfo<'_> {
    pub fn range(&self) -> &ChunkRange {
        &self.chunk.range
    }

    pub fn version(&self) -> ChunkVersion {
        self.chunk.version
    }

    pub fn history(&self) -> &[ChunkHistory] {
        &self.chunk.history
    }

    /// Owner of the chunk at the lookup's cluster time, or the current owner for a latest-time
    /// lookup.
    pub fn shard_id(&self) -> Result<&ShardId> {
        let Some(at) = self.at else {
            return Ok(&self.chunk.shard);
        };
        self.chunk
            .history
            .iter()
            .find(|h| h.valid_after <= at)
            .map(|h| &h.shard)
            .ok_or_else(|| self.stale_history(at))
    }

    /// Fail if the chunk changed owner after the lookup's cluster time.
    pub fn throw_if_moved(&self) -> Result<()> {
        let Some(at) = self.at else {
            return Ok(());
        };
        let (Some(newest), Some(oldest)) = (self.chunk.history.first(), self.chunk.history.last())
        else {
            return Err(self.stale_history(at));
        };
        if newest.valid_after <= at {
            return Ok(());
        }
        if oldest.valid_after > at {
            return Err(self.stale_history(at));
        }
        Err(CatalogError::ChunkOwnerMoved {
            uuid: self.chunk.collection_uuid,
            key: self.key.clone(),
            at,
            moved_at: newest.valid_after,
        })
    }

    fn stale_history(&self, at: Timestamp) -> CatalogError {
        CatalogError::StaleChunkHistory {
            uuid: self.chunk.collection_uuid,
            key: self.key.clone(),
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use shardkeeper_types::{ErrorCode, KeyPart};
    use uuid::Uuid;

    use super::*;

    fn collection() -> CollectionCatalogEntry {
        CollectionCatalogEntry::new(
            NamespaceString::new("db", "orders"),
            CollectionUuid::new(),
            ShardKeyPattern::new(["x"]).unwrap(),
            CollectionGeneration::new(Uuid::new_v4(), Timestamp::new(1, 1)),
        )
    }

    fn key(v: i64) -> ShardKeyValue {
        ShardKeyValue::new([KeyPart::Int(v)])
    }

    /// Chunks split at `split_points`, alternating between two shards.
    fn chunks_at(coll: &CollectionCatalogEntry, split_points: &[i64]) -> Vec<ChunkEntry> {
        let mut bounds = vec![coll.key_pattern.global_min()];
        bounds.extend(split_points.iter().map(|p| key(*p)));
        bounds.push(coll.key_pattern.global_max());
        bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                ChunkEntry::new(
                    coll.uuid,
                    ChunkRange::new(w[0].clone(), w[1].clone()),
                    ShardId::new(if i % 2 == 0 { "shard0" } else { "shard1" }),
                    ChunkVersion::new(coll.generation, 1, i as u32),
                    Timestamp::new(10, 1),
                )
            })
            .collect()
    }

    #[test]
    fn rejects_gaps_and_foreign_chunks() {
        let coll = collection();
        let mut chunks = chunks_at(&coll, &[0, 10]);
        chunks.remove(1);
        assert!(matches!(
            ChunkManager::new(&coll, chunks),
            Err(CatalogError::InvalidRoutingTable { .. })
        ));

        let mut chunks = chunks_at(&coll, &[0]);
        chunks[1].collection_uuid = CollectionUuid::new();
        assert!(ChunkManager::new(&coll, chunks).is_err());

        assert!(ChunkManager::new(&coll, vec![]).is_err());
    }

    #[test]
    fn collection_and_shard_versions() {
        let coll = collection();
        let cm = ChunkManager::new(&coll, chunks_at(&coll, &[0, 10, 20])).unwrap();
        assert_eq!(ChunkVersion::new(coll.generation, 1, 3), cm.version());
        assert_eq!(
            Some(ChunkVersion::new(coll.generation, 1, 2)),
            cm.shard_version(&ShardId::new("shard0"))
        );
        assert_eq!(None, cm.shard_version(&ShardId::new("shard9")));
    }

    #[test]
    fn ownership_at_past_cluster_time() {
        let coll = collection();
        let mut chunks = chunks_at(&coll, &[0]);
        // [0, MaxKey) moved from shard1 to shard0 at T=50
        let moved = chunks.pop().unwrap().moved_to(
            ShardId::new("shard0"),
            Timestamp::new(50, 1),
            ChunkVersion::new(coll.generation, 2, 0),
        );
        chunks.push(moved);
        let cm = ChunkManager::new(&coll, chunks).unwrap();

        let before = cm.make_at_time(Timestamp::new(40, 1));
        let chunk = before
            .find_intersecting_chunk_with_simple_collation(&key(5))
            .unwrap();
        assert_eq!("shard1", chunk.shard_id().unwrap().as_str());
        assert_eq!(
            ErrorCode::ChunkOwnerMoved,
            chunk.throw_if_moved().unwrap_err().code()
        );

        let after = cm.make_at_time(Timestamp::new(60, 1));
        let chunk = after
            .find_intersecting_chunk_with_simple_collation(&key(5))
            .unwrap();
        assert_eq!("shard0", chunk.shard_id().unwrap().as_str());
        chunk.throw_if_moved().unwrap();

        // the other chunk never moved
        before
            .find_intersecting_chunk_with_simple_collation(&key(-5))
            .unwrap()
            .throw_if_moved()
            .unwrap();

        // older than any history
        let ancient = cm.make_at_time(Timestamp::new(1, 1));
        let chunk = ancient
            .find_intersecting_chunk_with_simple_collation(&key(5))
            .unwrap();
        assert_eq!(
            ErrorCode::StaleChunkHistory,
            chunk.throw_if_moved().unwrap_err().code()
        );
        assert_eq!(
            ErrorCode::StaleChunkHistory,
            chunk.shard_id().unwrap_err().code()
        );
    }

    proptest! {
        #[test]
        fn every_key_maps_to_the_chunk_containing_it(
            mut splits in proptest::collection::vec(-1000i64..1000, 0..20),
            probe in any::<i64>()
        ) {
            splits.sort_unstable();
            splits.dedup();
            let coll = collection();
            let cm = ChunkManager::new(&coll, chunks_at(&coll, &splits)).unwrap();
            let k = key(probe);
            let chunk = cm.find_intersecting_chunk_with_simple_collation(&k).unwrap();
            prop_assert!(chunk.range().contains(&k));
            let containing = cm.chunks().iter().filter(|c| c.range.contains(&k)).count();
            prop_assert_eq!(1, containing);
        }
    }
}
