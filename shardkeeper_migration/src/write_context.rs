//! State of one user operation as it passes through the observer chain.

use hashbrown::HashMap;
use shardkeeper_types::{
    DatabaseName, DatabaseVersion, Document, DocumentKey, NamespaceString, OpTime,
    OperationSessionInfo, ShardVersion, Timestamp,
};

use crate::{cloner::OpKind, recovery_unit::RecoveryUnit, side_channel::OpStateAccumulator};

/// A write performed inside a multi-document transaction, kept until the transaction commits or
/// prepares.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOperation {
    pub nss: NamespaceString,
    pub kind: OpKind,
    /// Full document for inserts, post-image for updates.
    pub document: Option<Document>,
    pub pre_image: Option<Document>,
    /// Set for deletes.
    pub document_key: Option<DocumentKey>,
    pub from_migrate: bool,
}

impl TransactionOperation {
    pub fn insert(nss: NamespaceString, doc: Document) -> Self {
        Self {
            nss,
            kind: OpKind::Insert,
            document: Some(doc),
            pre_image: None,
            document_key: None,
            from_migrate: false,
        }
    }

    pub fn update(nss: NamespaceString, pre_image: Option<Document>, post_image: Document) -> Self {
        Self {
            nss,
            kind: OpKind::Update,
            document: Some(post_image),
            pre_image,
            document_key: None,
            from_migrate: false,
        }
    }

    pub fn delete(nss: NamespaceString, document_key: DocumentKey) -> Self {
        Self {
            nss,
            kind: OpKind::Delete,
            document: None,
            pre_image: None,
            document_key: Some(document_key),
            from_migrate: false,
        }
    }
}

#[derive(Debug)]
pub struct TransactionContext {
    pub osi: OperationSessionInfo,
    /// Snapshot the transaction reads at, if it reads at a fixed cluster time.
    pub at_cluster_time: Option<Timestamp>,
    operations: Vec<TransactionOperation>,
}

impl TransactionContext {
    pub fn new(osi: OperationSessionInfo) -> Self {
        Self {
            osi,
            at_cluster_time: None,
            operations: vec![],
        }
    }

    pub fn with_at_cluster_time(self, at: Timestamp) -> Self {
        Self {
            at_cluster_time: Some(at),
            ..self
        }
    }

    pub fn push(&mut self, op: TransactionOperation) {
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[TransactionOperation] {
        &self.operations
    }
}

/// Everything the observers of a write can see and attach to.
#[derive(Debug, Default)]
pub struct WriteContext {
    from_migrate: bool,
    shard_versions: HashMap<NamespaceString, ShardVersion>,
    db_versions: HashMap<DatabaseName, DatabaseVersion>,
    transaction: Option<TransactionContext>,
    side_channel: OpStateAccumulator,
    recovery_unit: RecoveryUnit,
    op_time: Option<OpTime>,
}

impl WriteContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(txn: TransactionContext) -> Self {
        Self {
            transaction: Some(txn),
            ..Self::default()
        }
    }

    /// Mark the operation as applied by a migration.
    pub fn from_migrate(mut self) -> Self {
        self.from_migrate = true;
        self
    }

    pub fn with_shard_version(mut self, nss: NamespaceString, version: ShardVersion) -> Self {
        self.shard_versions.insert(nss, version);
        self
    }

    pub fn with_db_version(mut self, db: DatabaseName, version: DatabaseVersion) -> Self {
        self.db_versions.insert(db, version);
        self
    }

    pub fn is_from_migrate(&self) -> bool {
        self.from_migrate
    }

    pub fn shard_version(&self, nss: &NamespaceString) -> Option<ShardVersion> {
        self.shard_versions.get(nss).copied()
    }

    pub fn db_version(&self, db: &DatabaseName) -> Option<DatabaseVersion> {
        self.db_versions.get(db).copied()
    }

    pub fn transaction(&self) -> Option<&TransactionContext> {
        self.transaction.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut TransactionContext> {
        self.transaction.as_mut()
    }

    pub fn side_channel(&self) -> &OpStateAccumulator {
        &self.side_channel
    }

    pub fn side_channel_mut(&mut self) -> &mut OpStateAccumulator {
        &mut self.side_channel
    }

    pub fn recovery_unit_mut(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    /// Log position of the current write, or of the commit/prepare entry of the transaction.
    pub fn op_time(&self) -> Option<OpTime> {
        self.op_time
    }

    pub fn set_op_time(&mut self, op_time: OpTime) {
        self.op_time = Some(op_time);
    }

    /// Commit the storage transaction, running the deferred handlers.
    pub fn commit(mut self) -> Option<OpTime> {
        let op_time = self.op_time;
        self.recovery_unit.commit(op_time);
        op_time
    }

    pub fn abort(mut self) {
        self.recovery_unit.rollback();
    }
}
