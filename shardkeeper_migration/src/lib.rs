//! The shard-local half of chunk migration: sharding state per collection and database, the
//! observer chain every write passes through, and the interceptor that checks writes against the
//! sharding state and mirrors them to an in-progress migration.

pub mod cloner;
pub mod error;
pub mod interceptor;
pub mod op_observer;
pub mod oplog;
pub mod ownership;
pub mod recovery_unit;
pub mod sharding_state;
pub mod side_channel;
pub mod source_manager;
pub mod transaction_handler;
pub mod write_context;

#[cfg(test)]
mod test_util;

pub use cloner::{BufferedOp, MigrationCloner, MigrationClonerSession, OpKind};
pub use error::{Result, WriteError};
pub use interceptor::MigrationWriteInterceptor;
pub use op_observer::{OpObserver, OpObserverRegistry, UpdateArgs};
pub use oplog::{LocalOplog, OplogEntry, OplogEntryKind, OplogObserver, ReplicationLog};
pub use ownership::assert_intersecting_chunk_has_not_moved;
pub use recovery_unit::{Change, RecoveryUnit};
pub use sharding_state::{
    CollectionMetadata, CollectionShardingRuntime, DatabaseShardingState, ShardingStateRegistry,
    ShardingWriteRouter,
};
pub use side_channel::{OpStateAccumulator, SideChannelKey, SideChannelValue};
pub use source_manager::{MigrationSourceManager, is_migrating};
pub use transaction_handler::TransactionHandler;
pub use write_context::{TransactionContext, TransactionOperation, WriteContext};
