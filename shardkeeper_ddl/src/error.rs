use shardkeeper_catalog::CatalogError;
use shardkeeper_types::{ErrorCode, NamespaceString, ShardId, Status};
use thiserror::Error;

use crate::lock_manager::{LockMode, ResourceId};

#[derive(Debug, Error, Clone)]
pub enum DdlError {
    #[error("could not acquire {mode:?} lock on {resource} for '{reason}': {detail}")]
    LockTimeout {
        resource: ResourceId,
        mode: LockMode,
        reason: String,
        detail: String,
    },

    #[error("node is not primary")]
    NotWritablePrimary,

    #[error("operation was interrupted")]
    Interrupted,

    #[error("namespace {0} not found")]
    NamespaceNotFound(NamespaceString),

    #[error("namespace {nss} already exists on shards {shards:?}")]
    NamespaceExists {
        nss: NamespaceString,
        shards: Vec<ShardId>,
    },

    #[error("collection {nss} has a different uuid on shards {shards:?}")]
    InvalidUuid {
        nss: NamespaceString,
        shards: Vec<ShardId>,
    },

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("conflicting DDL operation in progress: {0}")]
    ConflictingOperation(String),

    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("shard {shard} failed: {status}")]
    Remote { shard: ShardId, status: Status },

    #[error("malformed recovery document: {0}")]
    MalformedRecoveryDocument(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl DdlError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::NotWritablePrimary => ErrorCode::NotWritablePrimary,
            Self::Interrupted => ErrorCode::Interrupted,
            Self::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            Self::NamespaceExists { .. } => ErrorCode::NamespaceExists,
            Self::InvalidUuid { .. } => ErrorCode::InvalidUUID,
            Self::InvalidNamespace(_) => ErrorCode::InvalidNamespace,
            Self::CommandFailed(_) => ErrorCode::CommandFailed,
            Self::ConflictingOperation(_) => ErrorCode::ConflictingOperationInProgress,
            Self::ShardNotFound(_) => ErrorCode::ShardNotFound,
            Self::Remote { status, .. } => status.code(),
            Self::MalformedRecoveryDocument(_) => ErrorCode::InternalError,
            Self::Catalog(e) => e.code(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// The error as a status that can be persisted or sent to another node.
    pub fn to_status(&self) -> Status {
        Status::new(self.code(), self.to_string())
    }
}

pub type Result<T, E = DdlError> = std::result::Result<T, E>;
