use shardkeeper_catalog::CatalogError;
use shardkeeper_types::{
    DatabaseName, DatabaseVersion, ErrorCode, NamespaceString, ShardVersion,
    document::ShardKeyError,
};
use thiserror::Error;

/// Errors returned to a user write by the sharding write path, and by migration bookkeeping.
#[derive(Debug, Error, Clone)]
pub enum WriteError {
    #[error(
        "shard version mismatch for {nss}: request has {received}, shard has {}",
        wanted.map(|v| v.to_string()).unwrap_or_else(|| "unknown metadata".to_string())
    )]
    StaleConfig {
        nss: NamespaceString,
        received: ShardVersion,
        wanted: Option<ShardVersion>,
    },

    #[error(
        "database version mismatch for {db}: request has {received}, shard has {}",
        wanted.map(|v| v.to_string()).unwrap_or_else(|| "unknown version".to_string())
    )]
    StaleDbVersion {
        db: DatabaseName,
        received: DatabaseVersion,
        wanted: Option<DatabaseVersion>,
    },

    #[error("cannot write to {0} while its database primary is moving")]
    MovePrimaryInProgress(NamespaceString),

    #[error("namespace {0} is not sharded")]
    NamespaceNotSharded(NamespaceString),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperation(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("write to {0} was not assigned a log position")]
    MissingOpTime(NamespaceString),

    #[error("observer {observer} failed: {source}")]
    Observer {
        observer: &'static str,
        source: Box<WriteError>,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    ShardKey(#[from] ShardKeyError),
}

impl WriteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StaleConfig { .. } => ErrorCode::StaleConfig,
            Self::StaleDbVersion { .. } => ErrorCode::StaleDbVersion,
            Self::MovePrimaryInProgress(_) => ErrorCode::MovePrimaryInProgress,
            Self::NamespaceNotSharded(_) => ErrorCode::NamespaceNotSharded,
            Self::ConflictingOperation(_) => ErrorCode::ConflictingOperationInProgress,
            Self::CommandFailed(_) => ErrorCode::CommandFailed,
            Self::MissingOpTime(_) => ErrorCode::InternalError,
            Self::Observer { source, .. } => source.code(),
            Self::Catalog(e) => e.code(),
            Self::ShardKey(e) => e.code(),
        }
    }
}

pub type Result<T, E = WriteError> = std::result::Result<T, E>;
