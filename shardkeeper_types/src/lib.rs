//! Shared vocabulary for the sharding metadata layer.
//!
//! Everything in here is plain data: namespaces, identifiers, logical time, placement versions,
//! retryable-write session info, documents and shard keys, durability levels and the error code
//! taxonomy that every other crate maps its errors onto.

pub mod concern;
pub mod document;
pub mod ids;
pub mod namespace;
pub mod session;
pub mod status;
pub mod time;
pub mod version;

pub use concern::{ReadConcern, WriteConcern};
pub use document::{Document, DocumentKey, KeyPart, ShardKeyError, ShardKeyPattern, ShardKeyValue};
pub use ids::{CollectionUuid, ShardId};
pub use namespace::{DatabaseName, NamespaceError, NamespaceString};
pub use session::{OperationSessionInfo, SessionId, StmtId, TxnNumber};
pub use status::{ErrorCode, Status};
pub use time::{ClusterClock, OpTime, Timestamp};
pub use version::{ChunkVersion, CollectionGeneration, DatabaseVersion, ShardVersion};
