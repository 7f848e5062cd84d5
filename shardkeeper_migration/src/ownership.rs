//! Detects chunk migrations that happened after a transaction's snapshot.

use shardkeeper_types::{ShardKeyValue, Timestamp};

use crate::{error::Result, sharding_state::CollectionMetadata};

/// Fail with `ChunkOwnerMoved` if the chunk containing `key` changed owner after `at`, or with
/// `StaleChunkHistory` if the chunk's history does not reach back to `at`.
///
/// A transaction reading at `at` on this shard could otherwise write a document whose chunk has
/// already been migrated elsewhere. Unsharded collections have no chunks and always pass.
pub fn assert_intersecting_chunk_has_not_moved(
    metadata: &CollectionMetadata,
    key: &ShardKeyValue,
    at: Timestamp,
) -> Result<()> {
    let Some(cm) = metadata.chunk_manager() else {
        return Ok(());
    };
    let at_time = cm.make_at_time(at);
    at_time
        .find_intersecting_chunk_with_simple_collation(key)?
        .throw_if_moved()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use shardkeeper_catalog::{ChunkEntry, ChunkManager, ChunkRange};
    use shardkeeper_types::{ChunkVersion, ErrorCode, KeyPart, ShardId};

    use super::*;
    use crate::test_util::orders_collection;

    fn key(v: i64) -> ShardKeyValue {
        ShardKeyValue::new([KeyPart::Int(v)])
    }

    /// `[MinKey, 0)` never moves, `[0, MaxKey)` moves from s1 to s0 at `moved_at`.
    fn metadata(moved_at: u32) -> CollectionMetadata {
        let coll = orders_collection();
        let created = Timestamp::new(10, 0);
        let chunks = vec![
            ChunkEntry::new(
                coll.uuid,
                ChunkRange::new(coll.key_pattern.global_min(), key(0)),
                ShardId::new("s0"),
                ChunkVersion::new(coll.generation, 1, 0),
                created,
            ),
            ChunkEntry::new(
                coll.uuid,
                ChunkRange::new(key(0), coll.key_pattern.global_max()),
                ShardId::new("s1"),
                ChunkVersion::new(coll.generation, 1, 1),
                created,
            )
            .moved_to(
                ShardId::new("s0"),
                Timestamp::new(moved_at, 0),
                ChunkVersion::new(coll.generation, 2, 0),
            ),
        ];
        CollectionMetadata::sharded(
            ChunkManager::new(&coll, chunks).unwrap(),
            ShardId::new("s0"),
        )
    }

    #[test]
    fn unsharded_collections_always_pass() {
        assert_intersecting_chunk_has_not_moved(
            &CollectionMetadata::unsharded(ShardId::new("s0")),
            &key(1),
            Timestamp::new(1, 0),
        )
        .unwrap();
    }

    #[test]
    fn snapshot_before_history_is_stale() {
        let err = assert_intersecting_chunk_has_not_moved(
            &metadata(50),
            &key(-1),
            Timestamp::new(5, 0),
        )
        .unwrap_err();
        assert_eq!(ErrorCode::StaleChunkHistory, err.code());
    }

    proptest! {
        #[test]
        fn fails_only_for_moved_chunk_read_before_the_move(
            moved_at in 20u32..1000,
            snapshot in 10u32..2000,
            probe in -1000i64..1000
        ) {
            let result = assert_intersecting_chunk_has_not_moved(
                &metadata(moved_at),
                &key(probe),
                Timestamp::new(snapshot, 0),
            );
            let should_fail = probe >= 0 && snapshot < moved_at;
            match result {
                Ok(()) => prop_assert!(!should_fail),
                Err(e) => {
                    prop_assert!(should_fail);
                    prop_assert_eq!(ErrorCode::ChunkOwnerMoved, e.code());
                }
            }
        }
    }
}
