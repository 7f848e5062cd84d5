//! Abstraction over the catalog's persisted tables.

use std::fmt::Debug;

use async_trait::async_trait;
use shardkeeper_types::{
    CollectionUuid, NamespaceString, OperationSessionInfo, ReadConcern, StmtId, WriteConcern,
};

use crate::{
    entries::{
        ChunkEntry, CollectionCatalogEntry, IndexCatalogEntry, PlacementHistoryEntry,
        QueryAnalyzerEntry, RecoveryDocument, RecoveryDocumentId, TagEntry,
    },
    error::Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAnalyzerFilter {
    Namespace(NamespaceString),
    CollectionUuid(CollectionUuid),
}

impl QueryAnalyzerFilter {
    pub fn matches(&self, entry: &QueryAnalyzerEntry) -> bool {
        match self {
            Self::Namespace(nss) => &entry.nss == nss,
            Self::CollectionUuid(uuid) => &entry.collection_uuid == uuid,
        }
    }
}

/// A single catalog mutation.
#[derive(Debug, Clone)]
pub enum CatalogWriteOp {
    InsertCollection(CollectionCatalogEntry),
    /// Delete the entry of `nss` only if it still has `uuid`. Only allowed inside a transaction
    /// that also records the drop in the placement history.
    DeleteCollection {
        nss: NamespaceString,
        uuid: CollectionUuid,
    },
    /// Set the allow-migrations flag and bump the collection version.
    UpdateAllowMigrations {
        nss: NamespaceString,
        expected_uuid: Option<CollectionUuid>,
        allow: bool,
    },
    InsertChunks(Vec<ChunkEntry>),
    /// Replace the chunks of a collection, used to commit a migration.
    ReplaceChunks {
        uuid: CollectionUuid,
        chunks: Vec<ChunkEntry>,
    },
    DeleteChunks {
        uuid: CollectionUuid,
    },
    InsertPlacementHistory(PlacementHistoryEntry),
    InsertIndexEntries(Vec<IndexCatalogEntry>),
    DeleteIndexEntries {
        uuid: CollectionUuid,
    },
    InsertTags(Vec<TagEntry>),
    DeleteTags {
        nss: NamespaceString,
    },
    InsertQueryAnalyzer(QueryAnalyzerEntry),
    DeleteQueryAnalyzers(QueryAnalyzerFilter),
    UpsertRecoveryDocument(RecoveryDocument),
    DeleteRecoveryDocument(RecoveryDocumentId),
    /// Bump the server configuration no-op counter.
    NoopWrite,
}

impl CatalogWriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InsertCollection(_) => "insert_collection",
            Self::DeleteCollection { .. } => "delete_collection",
            Self::UpdateAllowMigrations { .. } => "update_allow_migrations",
            Self::InsertChunks(_) => "insert_chunks",
            Self::ReplaceChunks { .. } => "replace_chunks",
            Self::DeleteChunks { .. } => "delete_chunks",
            Self::InsertPlacementHistory(_) => "insert_placement_history",
            Self::InsertIndexEntries(_) => "insert_index_entries",
            Self::DeleteIndexEntries { .. } => "delete_index_entries",
            Self::InsertTags(_) => "insert_tags",
            Self::DeleteTags { .. } => "delete_tags",
            Self::InsertQueryAnalyzer(_) => "insert_query_analyzer",
            Self::DeleteQueryAnalyzers(_) => "delete_query_analyzers",
            Self::UpsertRecoveryDocument(_) => "upsert_recovery_document",
            Self::DeleteRecoveryDocument(_) => "delete_recovery_document",
            Self::NoopWrite => "noop_write",
        }
    }
}

/// Outcome of a write: the number of affected rows.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub n: u64,
}

impl WriteResult {
    pub fn new(n: u64) -> Self {
        Self { n }
    }
}

/// An open multi-statement transaction on the catalog.
///
/// Replaying a committed `(session, txn number)` returns the recorded result of every statement
/// without applying it again.
#[async_trait]
pub trait CatalogTransaction: Debug + Send {
    async fn run_crud_op(&mut self, op: CatalogWriteOp, stmt_id: StmtId) -> Result<WriteResult>;

    /// Make every statement visible atomically.
    async fn commit(self: Box<Self>, write_concern: WriteConcern) -> Result<()>;

    /// Discard every statement. Leaves no trace in the session table.
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait CatalogStore: Debug + Send + Sync + 'static {
    /// Start (or resume the replay of) the transaction identified by `osi`.
    async fn start_transaction(
        &self,
        osi: OperationSessionInfo,
    ) -> Result<Box<dyn CatalogTransaction>>;

    /// Apply a single non-transactional write.
    async fn write(&self, op: CatalogWriteOp, write_concern: WriteConcern) -> Result<WriteResult>;

    async fn find_collection(
        &self,
        nss: &NamespaceString,
        read_concern: ReadConcern,
    ) -> Result<Option<CollectionCatalogEntry>>;

    async fn collections(&self, read_concern: ReadConcern) -> Result<Vec<CollectionCatalogEntry>>;

    async fn chunks(
        &self,
        uuid: CollectionUuid,
        read_concern: ReadConcern,
    ) -> Result<Vec<ChunkEntry>>;

    async fn placement_history(
        &self,
        nss: &NamespaceString,
        read_concern: ReadConcern,
    ) -> Result<Vec<PlacementHistoryEntry>>;

    async fn index_entries(
        &self,
        uuid: CollectionUuid,
        read_concern: ReadConcern,
    ) -> Result<Vec<IndexCatalogEntry>>;

    async fn tags(&self, nss: &NamespaceString, read_concern: ReadConcern)
    -> Result<Vec<TagEntry>>;

    async fn query_analyzers(&self, read_concern: ReadConcern) -> Result<Vec<QueryAnalyzerEntry>>;

    async fn recovery_documents(&self, read_concern: ReadConcern)
    -> Result<Vec<RecoveryDocument>>;

    /// Value of the server configuration no-op counter.
    async fn noop_write_count(&self, read_concern: ReadConcern) -> Result<u64>;
}
