//! The cluster-wide sharding catalog: persisted tables, the store abstraction and its in-memory
//! implementation, the transaction executor used by DDL coordinators and the routing table built
//! from chunk entries.

pub mod entries;
pub mod error;
pub mod executor;
pub mod mem;
mod metrics;
pub mod routing;
pub mod store;

pub use entries::{
    ChunkEntry, ChunkHistory, ChunkRange, CollectionCatalogEntry, IndexCatalogEntry,
    PlacementHistoryEntry, QueryAnalyzerEntry, RecoveryDocument, RecoveryDocumentId, TagEntry,
};
pub use error::{CatalogError, Result};
pub use executor::{
    DeleteCollectionTransaction, TransactionChain, run_retryable_write,
    run_transaction_on_sharding_catalog,
};
pub use mem::MemCatalogStore;
pub use routing::{ChunkInfo, ChunkManager};
pub use store::{CatalogStore, CatalogTransaction, CatalogWriteOp, QueryAnalyzerFilter, WriteResult};
