//! The replication log and the observer that writes to it.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use observability_deps::tracing::trace;
use parking_lot::Mutex;
use shardkeeper_types::{ClusterClock, Document, DocumentKey, NamespaceString, OpTime};

use crate::{
    error::Result,
    op_observer::{OpObserver, UpdateArgs},
    sharding_state::{ShardingStateRegistry, ShardingWriteRouter},
    side_channel::SideChannelValue,
    write_context::{TransactionOperation, WriteContext},
};

#[derive(Debug, Clone, PartialEq)]
pub enum OplogEntryKind {
    Insert,
    Update,
    Delete,
    /// Commit of an unprepared transaction, carrying all of its operations.
    ApplyOps(Vec<TransactionOperation>),
    Prepare(Vec<TransactionOperation>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    pub op_time: OpTime,
    /// Unset for transaction entries.
    pub nss: Option<NamespaceString>,
    pub kind: OplogEntryKind,
    pub from_migrate: bool,
}

/// Ordered log of committed writes.
pub trait ReplicationLog: Debug + Send + Sync {
    /// Reserve the position of the next entry.
    fn reserve(&self) -> OpTime;

    fn append(&self, entry: OplogEntry);
}

/// In-process log of one replica set member. Entries are stamped with the member's current term.
#[derive(Debug)]
pub struct LocalOplog {
    term: AtomicI64,
    clock: Arc<ClusterClock>,
    entries: Mutex<Vec<OplogEntry>>,
}

impl LocalOplog {
    pub fn new(term: i64, clock: Arc<ClusterClock>) -> Self {
        Self {
            term: AtomicI64::new(term),
            clock,
            entries: Default::default(),
        }
    }

    /// Called on step-up so that later entries carry the new term.
    pub fn set_term(&self, term: i64) {
        self.term.store(term, Ordering::Release);
    }

    pub fn entries(&self) -> Vec<OplogEntry> {
        self.entries.lock().clone()
    }
}

impl ReplicationLog for LocalOplog {
    fn reserve(&self) -> OpTime {
        OpTime::new(self.term.load(Ordering::Acquire), self.clock.tick())
    }

    fn append(&self, entry: OplogEntry) {
        trace!(op_time = ?entry.op_time, nss = ?entry.nss, "appending oplog entry");
        self.entries.lock().push(entry);
    }
}

/// First observer of the chain: logs each write (or buffers it inside a transaction), assigns its
/// op time and attaches the sharding state the write is routed against.
#[derive(Debug)]
pub struct OplogObserver {
    oplog: Arc<dyn ReplicationLog>,
    sharding_state: Arc<ShardingStateRegistry>,
}

impl OplogObserver {
    pub fn new(
        oplog: Arc<dyn ReplicationLog>,
        sharding_state: Arc<ShardingStateRegistry>,
    ) -> Self {
        Self {
            oplog,
            sharding_state,
        }
    }

    fn log_or_buffer(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        kind: OplogEntryKind,
        op: TransactionOperation,
    ) {
        let from_migrate = ctx.is_from_migrate();
        if let Some(txn) = ctx.transaction_mut() {
            txn.push(TransactionOperation { from_migrate, ..op });
            return;
        }

        let op_time = self.oplog.reserve();
        self.oplog.append(OplogEntry {
            op_time,
            nss: Some(nss.clone()),
            kind,
            from_migrate,
        });
        ctx.set_op_time(op_time);
        ctx.side_channel_mut()
            .insert(SideChannelValue::ShardingWriteRouter(Arc::new(
                ShardingWriteRouter::new(&self.sharding_state, nss),
            )));
    }

    fn log_transaction(&self, ctx: &mut WriteContext, kind: OplogEntryKind) {
        let op_time = self.oplog.reserve();
        self.oplog.append(OplogEntry {
            op_time,
            nss: None,
            kind,
            from_migrate: ctx.is_from_migrate(),
        });
        ctx.set_op_time(op_time);
    }
}

impl OpObserver for OplogObserver {
    fn name(&self) -> &'static str {
        "oplog"
    }

    fn on_insert(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        doc: &Document,
    ) -> Result<()> {
        self.log_or_buffer(
            ctx,
            nss,
            OplogEntryKind::Insert,
            TransactionOperation::insert(nss.clone(), doc.clone()),
        );
        Ok(())
    }

    fn on_update(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        args: &UpdateArgs,
    ) -> Result<()> {
        self.log_or_buffer(
            ctx,
            nss,
            OplogEntryKind::Update,
            TransactionOperation::update(
                nss.clone(),
                args.pre_image.clone(),
                args.post_image.clone(),
            ),
        );
        Ok(())
    }

    fn on_delete(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        document_key: &DocumentKey,
    ) -> Result<()> {
        self.log_or_buffer(
            ctx,
            nss,
            OplogEntryKind::Delete,
            TransactionOperation::delete(nss.clone(), document_key.clone()),
        );
        Ok(())
    }

    fn on_unprepared_transaction_commit(
        &self,
        ctx: &mut WriteContext,
        operations: &[TransactionOperation],
    ) -> Result<()> {
        self.log_transaction(ctx, OplogEntryKind::ApplyOps(operations.to_vec()));
        Ok(())
    }

    fn on_transaction_prepare(
        &self,
        ctx: &mut WriteContext,
        operations: &[TransactionOperation],
    ) -> Result<()> {
        self.log_transaction(ctx, OplogEntryKind::Prepare(operations.to_vec()));
        Ok(())
    }

    fn on_transaction_prepare_non_primary(
        &self,
        ctx: &mut WriteContext,
        _operations: &[TransactionOperation],
        prepare_op_time: OpTime,
    ) -> Result<()> {
        // the prepare entry was written by the primary
        ctx.set_op_time(prepare_op_time);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use iox_time::{MockProvider, Time};
    use serde_json::json;
    use shardkeeper_types::{OperationSessionInfo, SessionId, ShardId, TxnNumber};

    use super::*;
    use crate::{test_util::doc, write_context::TransactionContext};

    fn observer() -> (Arc<LocalOplog>, OplogObserver) {
        let clock = Arc::new(ClusterClock::new(Arc::new(MockProvider::new(
            Time::from_timestamp(100, 0).unwrap(),
        ))));
        let oplog = Arc::new(LocalOplog::new(1, clock));
        let observer = OplogObserver::new(
            Arc::<LocalOplog>::clone(&oplog),
            Arc::new(ShardingStateRegistry::new(ShardId::new("s0"))),
        );
        (oplog, observer)
    }

    #[test]
    fn assigns_increasing_op_times() {
        let (oplog, observer) = observer();
        let nss = NamespaceString::new("db", "orders");

        let mut first = WriteContext::new();
        observer
            .on_insert(&mut first, &nss, &doc(json!({"_id": 1})))
            .unwrap();
        let mut second = WriteContext::new().from_migrate();
        observer
            .on_insert(&mut second, &nss, &doc(json!({"_id": 2})))
            .unwrap();

        assert!(first.op_time().unwrap() < second.op_time().unwrap());
        assert!(first.side_channel().sharding_write_router().is_some());
        let entries = oplog.entries();
        assert_eq!(2, entries.len());
        assert!(!entries[0].from_migrate);
        assert!(entries[1].from_migrate);
    }

    #[test]
    fn buffers_transaction_operations_until_commit() {
        let (oplog, observer) = observer();
        let nss = NamespaceString::new("db", "orders");
        let mut ctx = WriteContext::in_transaction(TransactionContext::new(
            OperationSessionInfo::new(SessionId::new(), TxnNumber::new(1)),
        ));
        observer
            .on_insert(&mut ctx, &nss, &doc(json!({"_id": 1})))
            .unwrap();
        observer
            .on_insert(&mut ctx, &nss, &doc(json!({"_id": 2})))
            .unwrap();
        assert!(oplog.entries().is_empty());
        assert!(ctx.op_time().is_none());

        let ops = ctx.transaction().unwrap().operations().to_vec();
        assert_eq!(2, ops.len());
        observer
            .on_unprepared_transaction_commit(&mut ctx, &ops)
            .unwrap();

        let entries = oplog.entries();
        assert_eq!(1, entries.len());
        assert_eq!(Some(entries[0].op_time), ctx.op_time());
        assert!(matches!(&entries[0].kind, OplogEntryKind::ApplyOps(ops) if ops.len() == 2));
    }
}
