use shardkeeper_types::{
    CollectionUuid, ErrorCode, NamespaceString, SessionId, ShardKeyValue, StmtId, Timestamp,
    TxnNumber, document::ShardKeyError,
};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CatalogError {
    #[error("namespace {0} not found")]
    NamespaceNotFound(NamespaceString),

    #[error("namespace {0} is not sharded")]
    NamespaceNotSharded(NamespaceString),

    #[error("namespace {0} already exists")]
    NamespaceExists(NamespaceString),

    #[error("conflicting operation on {nss}: {reason}")]
    ConflictingOperation {
        nss: NamespaceString,
        reason: String,
    },

    #[error("illegal catalog operation: {0}")]
    IllegalOperation(String),

    #[error(
        "cannot start transaction {txn_number} on session {session_id} because a newer \
        transaction {current} has already started"
    )]
    TransactionTooOld {
        session_id: SessionId,
        txn_number: TxnNumber,
        current: TxnNumber,
    },

    #[error(
        "statement {stmt_id} of transaction {txn_number} on session {session_id} was never \
        executed, the transaction cannot be replayed with it"
    )]
    IncompleteTransactionHistory {
        session_id: SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    },

    #[error("operation was interrupted")]
    Interrupted,

    #[error("invalid routing table for {nss}: {reason}")]
    InvalidRoutingTable {
        nss: NamespaceString,
        reason: String,
    },

    #[error(
        "cannot find the shard owning {key} of collection {uuid} at cluster time {at}, the \
        chunk history does not go back that far"
    )]
    StaleChunkHistory {
        uuid: CollectionUuid,
        key: ShardKeyValue,
        at: Timestamp,
    },

    #[error(
        "chunk containing {key} of collection {uuid} has moved at {moved_at}, after the \
        snapshot timestamp {at}"
    )]
    ChunkOwnerMoved {
        uuid: CollectionUuid,
        key: ShardKeyValue,
        at: Timestamp,
        moved_at: Timestamp,
    },

    #[error(transparent)]
    ShardKey(#[from] ShardKeyError),
}

impl CatalogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            Self::NamespaceNotSharded(_) => ErrorCode::NamespaceNotSharded,
            Self::NamespaceExists(_) => ErrorCode::NamespaceExists,
            Self::ConflictingOperation { .. } => ErrorCode::ConflictingOperationInProgress,
            Self::IllegalOperation(_) => ErrorCode::IllegalOperation,
            Self::TransactionTooOld { .. } => ErrorCode::TransactionTooOld,
            Self::IncompleteTransactionHistory { .. } => ErrorCode::IncompleteTransactionHistory,
            Self::Interrupted => ErrorCode::Interrupted,
            Self::InvalidRoutingTable { .. } => ErrorCode::InternalError,
            Self::StaleChunkHistory { .. } => ErrorCode::StaleChunkHistory,
            Self::ChunkOwnerMoved { .. } => ErrorCode::ChunkOwnerMoved,
            Self::ShardKey(e) => e.code(),
        }
    }
}

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;
