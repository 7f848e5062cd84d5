//! Source side of a chunk migration: buffers the writes that hit the chunk being donated so the
//! destination can replay them in order.

use std::{
    fmt::{Debug, Display},
    sync::atomic::{AtomicBool, Ordering},
};

use observability_deps::tracing::{trace, warn};
use parking_lot::Mutex;
use shardkeeper_catalog::ChunkRange;
use shardkeeper_types::{
    CollectionUuid, Document, DocumentKey, OpTime, ShardId, ShardKeyPattern,
};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => f.write_str("i"),
            Self::Update => f.write_str("u"),
            Self::Delete => f.write_str("d"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedOp {
    pub document_key: DocumentKey,
    pub op_time: OpTime,
    pub kind: OpKind,
}

/// Receives the writes that must be mirrored to a migration destination.
pub trait MigrationCloner: Debug + Send + Sync {
    fn on_insert(&self, doc: &Document, op_time: OpTime);

    fn on_update(&self, pre_image: Option<&Document>, post_image: &Document, op_time: OpTime);

    fn on_delete(&self, document_key: &DocumentKey, op_time: OpTime);
}

/// Cloner of one in-progress migration of `range` from `source_shard` to `destination_shard`.
#[derive(Debug)]
pub struct MigrationClonerSession {
    id: Uuid,
    collection_uuid: CollectionUuid,
    source_shard: ShardId,
    destination_shard: ShardId,
    key_pattern: ShardKeyPattern,
    range: ChunkRange,
    max_buffered_ops: usize,
    buffered: Mutex<Vec<BufferedOp>>,
    overflowed: AtomicBool,
}

impl MigrationClonerSession {
    pub fn new(
        collection_uuid: CollectionUuid,
        source_shard: ShardId,
        destination_shard: ShardId,
        key_pattern: ShardKeyPattern,
        range: ChunkRange,
        max_buffered_ops: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection_uuid,
            source_shard,
            destination_shard,
            key_pattern,
            range,
            max_buffered_ops,
            buffered: Default::default(),
            overflowed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn collection_uuid(&self) -> CollectionUuid {
        self.collection_uuid
    }

    pub fn source_shard(&self) -> &ShardId {
        &self.source_shard
    }

    pub fn destination_shard(&self) -> &ShardId {
        &self.destination_shard
    }

    pub fn range(&self) -> &ChunkRange {
        &self.range
    }

    /// Whether `doc` lies in the chunk being migrated. Documents without a usable shard key never
    /// do.
    pub fn is_document_in_migrating_chunk(&self, doc: &Document) -> bool {
        self.key_pattern
            .extract_shard_key_from_doc(doc)
            .is_ok_and(|key| self.range.contains(&key))
    }

    fn is_key_in_migrating_chunk(&self, document_key: &DocumentKey) -> bool {
        self.key_pattern
            .extract_shard_key_from_document_key(document_key)
            .is_ok_and(|key| self.range.contains(&key))
    }

    /// Writes buffered so far, in the order they were committed.
    pub fn buffered_ops(&self) -> Vec<BufferedOp> {
        self.buffered.lock().clone()
    }

    /// Set once a write had to be dropped because the buffer was full. The migration cannot
    /// commit after that.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    fn buffer(&self, document_key: DocumentKey, op_time: OpTime, kind: OpKind) {
        let mut buffered = self.buffered.lock();
        if buffered.len() >= self.max_buffered_ops {
            if !self.overflowed.swap(true, Ordering::SeqCst) {
                warn!(
                    session = %self.id,
                    max_buffered_ops = self.max_buffered_ops,
                    "migration cloner buffer is full, the migration will have to be retried"
                );
            }
            return;
        }
        trace!(session = %self.id, %kind, ?op_time, "buffered write for migration");
        buffered.push(BufferedOp {
            document_key,
            op_time,
            kind,
        });
    }
}

impl MigrationCloner for MigrationClonerSession {
    fn on_insert(&self, doc: &Document, op_time: OpTime) {
        if self.is_document_in_migrating_chunk(doc) {
            self.buffer(self.key_pattern.document_key(doc), op_time, OpKind::Insert);
        }
    }

    fn on_update(&self, pre_image: Option<&Document>, post_image: &Document, op_time: OpTime) {
        if self.is_document_in_migrating_chunk(post_image) {
            self.buffer(
                self.key_pattern.document_key(post_image),
                op_time,
                OpKind::Update,
            );
        } else if let Some(pre_image) =
            pre_image.filter(|pre| self.is_document_in_migrating_chunk(pre))
        {
            // the update moved the document out of the chunk
            self.buffer(
                self.key_pattern.document_key(pre_image),
                op_time,
                OpKind::Delete,
            );
        }
    }

    fn on_delete(&self, document_key: &DocumentKey, op_time: OpTime) {
        if self.is_key_in_migrating_chunk(document_key) {
            self.buffer(document_key.clone(), op_time, OpKind::Delete);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shardkeeper_types::{KeyPart, ShardKeyValue, Timestamp};

    use super::*;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn session(max_buffered_ops: usize) -> MigrationClonerSession {
        MigrationClonerSession::new(
            CollectionUuid::new(),
            ShardId::new("s0"),
            ShardId::new("s1"),
            ShardKeyPattern::new(["x"]).unwrap(),
            ChunkRange::new(
                ShardKeyValue::new([KeyPart::Int(0)]),
                ShardKeyValue::new([KeyPart::Int(10)]),
            ),
            max_buffered_ops,
        )
    }

    fn op_time(secs: u32) -> OpTime {
        OpTime::new(1, Timestamp::new(secs, 0))
    }

    #[test]
    fn buffers_only_writes_in_range() {
        let cloner = session(100);
        cloner.on_insert(&doc(json!({"_id": 1, "x": 5})), op_time(1));
        cloner.on_insert(&doc(json!({"_id": 2, "x": 50})), op_time(2));
        cloner.on_insert(&doc(json!({"_id": 3})), op_time(3));
        // moved out of the chunk: delete of the old key
        cloner.on_update(
            Some(&doc(json!({"_id": 1, "x": 5}))),
            &doc(json!({"_id": 1, "x": 20})),
            op_time(4),
        );
        // entirely outside
        cloner.on_update(None, &doc(json!({"_id": 2, "x": 60})), op_time(5));
        cloner.on_delete(
            &ShardKeyPattern::new(["x"])
                .unwrap()
                .document_key(&doc(json!({"_id": 4, "x": 9}))),
            op_time(6),
        );

        let ops = cloner.buffered_ops();
        assert_eq!(
            vec![
                (OpKind::Insert, op_time(1)),
                (OpKind::Delete, op_time(4)),
                (OpKind::Delete, op_time(6)),
            ],
            ops.iter().map(|o| (o.kind, o.op_time)).collect::<Vec<_>>()
        );
        assert_eq!(Some(&json!(1)), ops[1].document_key.id());
        assert_eq!("u", OpKind::Update.to_string());
    }

    #[test]
    fn overflow_drops_writes_and_marks_session() {
        let cloner = session(2);
        for i in 0..4 {
            cloner.on_insert(&doc(json!({"_id": i, "x": i})), op_time(i as u32));
        }
        assert_eq!(2, cloner.buffered_ops().len());
        assert!(cloner.is_overflowed());
    }
}
