//! Deferred forwarding of committed writes to migration cloners.

use std::sync::Arc;

use observability_deps::tracing::{debug, trace};
use shardkeeper_types::{Document, DocumentKey, OpTime};

use crate::{
    cloner::{MigrationCloner, OpKind},
    recovery_unit::Change,
    sharding_state::ShardingStateRegistry,
    write_context::TransactionOperation,
};

/// One write outside a transaction, forwarded to the cloner it was routed against once its storage
/// transaction commits.
#[derive(Debug)]
pub(crate) struct ForwardWrite {
    pub(crate) cloner: Arc<dyn MigrationCloner>,
    pub(crate) op_time: OpTime,
    pub(crate) write: ForwardedWrite,
}

#[derive(Debug)]
pub(crate) enum ForwardedWrite {
    Insert(Document),
    Update {
        pre_image: Option<Document>,
        post_image: Document,
    },
    Delete(DocumentKey),
}

impl Change for ForwardWrite {
    /// Forwards at the position assigned to this write, not the storage transaction's last one.
    fn commit(self: Box<Self>, _commit_op_time: Option<OpTime>) {
        let op_time = self.op_time;
        match &self.write {
            ForwardedWrite::Insert(doc) => self.cloner.on_insert(doc, op_time),
            ForwardedWrite::Update {
                pre_image,
                post_image,
            } => self
                .cloner
                .on_update(pre_image.as_ref(), post_image, op_time),
            ForwardedWrite::Delete(key) => self.cloner.on_delete(key, op_time),
        }
    }

    fn rollback(self: Box<Self>) {}
}

/// Mirrors every operation of a committed or prepared transaction, in order, at the single log
/// position of the commit or prepare entry.
#[derive(Debug)]
pub struct TransactionHandler {
    sharding_state: Arc<ShardingStateRegistry>,
    operations: Vec<TransactionOperation>,
    op_time: OpTime,
}

impl TransactionHandler {
    pub fn new(
        sharding_state: Arc<ShardingStateRegistry>,
        operations: Vec<TransactionOperation>,
        op_time: OpTime,
    ) -> Self {
        Self {
            sharding_state,
            operations,
            op_time,
        }
    }

    fn forward(&self, op_time: OpTime) {
        for op in &self.operations {
            if op.from_migrate || op.nss.is_session_transactions_table() {
                continue;
            }
            let Some(cloner) = self.sharding_state.collection(&op.nss).cloner() else {
                continue;
            };
            trace!(nss = %op.nss, kind = %op.kind, ?op_time, "forwarding transaction operation");
            match (op.kind, &op.document, &op.document_key) {
                (OpKind::Insert, Some(doc), _) => cloner.on_insert(doc, op_time),
                (OpKind::Update, Some(post_image), _) => {
                    cloner.on_update(op.pre_image.as_ref(), post_image, op_time)
                }
                (OpKind::Delete, _, Some(key)) => cloner.on_delete(key, op_time),
                _ => debug!(nss = %op.nss, kind = %op.kind, "transaction operation without image"),
            }
        }
    }
}

impl Change for TransactionHandler {
    fn commit(self: Box<Self>, commit_op_time: Option<OpTime>) {
        self.forward(commit_op_time.unwrap_or(self.op_time));
    }

    fn rollback(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shardkeeper_catalog::ChunkRange;
    use shardkeeper_types::{
        CollectionUuid, KeyPart, NamespaceString, ShardId, ShardKeyPattern, ShardKeyValue,
        Timestamp,
    };

    use super::*;
    use crate::{cloner::MigrationClonerSession, test_util::doc};

    #[test]
    fn forwards_in_order_at_commit_time() {
        let registry = Arc::new(ShardingStateRegistry::new(ShardId::new("s0")));
        let nss = NamespaceString::new("db", "orders");
        let pattern = ShardKeyPattern::new(["x"]).unwrap();
        let session = Arc::new(MigrationClonerSession::new(
            CollectionUuid::new(),
            ShardId::new("s0"),
            ShardId::new("s1"),
            pattern.clone(),
            ChunkRange::new(
                ShardKeyValue::new([KeyPart::Int(0)]),
                ShardKeyValue::new([KeyPart::Int(100)]),
            ),
            10,
        ));
        registry
            .collection(&nss)
            .install_cloner(Arc::clone(&session))
            .unwrap();

        let mut migrated =
            TransactionOperation::insert(nss.clone(), doc(json!({"_id": 9, "x": 9})));
        migrated.from_migrate = true;
        let operations = vec![
            TransactionOperation::insert(nss.clone(), doc(json!({"_id": 1, "x": 1}))),
            migrated,
            TransactionOperation::insert(
                NamespaceString::new("db", "other"),
                doc(json!({"_id": 2, "x": 2})),
            ),
            TransactionOperation::update(nss.clone(), None, doc(json!({"_id": 1, "x": 3}))),
            TransactionOperation::delete(
                nss,
                pattern.document_key(&doc(json!({"_id": 1, "x": 3}))),
            ),
        ];
        let commit = OpTime::new(1, Timestamp::new(50, 1));
        let handler = Box::new(TransactionHandler::new(registry, operations, commit));
        assert!(session.buffered_ops().is_empty());
        handler.commit(None);

        let ops = session.buffered_ops();
        assert_eq!(
            vec![OpKind::Insert, OpKind::Update, OpKind::Delete],
            ops.iter().map(|o| o.kind).collect::<Vec<_>>()
        );
        assert!(ops.iter().all(|o| o.op_time == commit));
    }
}
