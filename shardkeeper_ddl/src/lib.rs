//! Serialization and crash recovery of administrative (DDL) operations.
//!
//! [`DdlLockManager`] serializes operations on databases and collections,
//! [`RecoveryTracker`] gates them on step-up recovery and [`DdlCoordinatorService`] runs the
//! coordinators that carry them out, resuming the ones a previous primary left unfinished.

pub mod coordinator;
pub mod drop_coordinator;
pub mod error;
pub mod lock_manager;
mod metrics;
pub mod participants;
pub mod recovery;
pub mod service;
pub mod util;

pub use coordinator::{CoordinatorContext, CoordinatorFactory, DdlArgs, DdlCoordinator};
pub use drop_coordinator::{
    DROP_COLLECTION_KIND, DropCollectionCoordinatorFactory, drop_collection_request,
};
pub use error::{DdlError, Result};
pub use lock_manager::{
    DdlLockInfo, DdlLockManager, LockMode, LockOwner, LockRequest, ResourceId, ScopedDdlLock,
};
pub use participants::{InMemoryShards, ShardClient};
pub use recovery::{RecoveryState, RecoveryTracker};
pub use service::{CoordinatorHandle, DdlCoordinatorService};
