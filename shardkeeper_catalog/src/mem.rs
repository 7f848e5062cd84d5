//! In-memory implementation of the [`CatalogStore`]. Used by tests and by nodes that run without
//! a persistent config server.
//!
//! Replication is modelled by two copies of the tables: the `local` one every write applies to,
//! and the `majority` one which catches up with `local` whenever a write asks for majority
//! durability. Majority reads are served from the latter.

use std::{collections::BTreeMap, fmt::Formatter, sync::Arc};

use async_trait::async_trait;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};
use shardkeeper_types::{
    CollectionUuid, NamespaceString, OperationSessionInfo, ReadConcern, SessionId, StmtId,
    TxnNumber, WriteConcern,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    entries::{
        ChunkEntry, CollectionCatalogEntry, IndexCatalogEntry, PlacementHistoryEntry,
        QueryAnalyzerEntry, RecoveryDocument, RecoveryDocumentId, TagEntry,
    },
    error::{CatalogError, Result},
    store::{CatalogStore, CatalogTransaction, CatalogWriteOp, WriteResult},
};

#[derive(Default)]
pub struct MemCatalogStore {
    state: Arc<Mutex<MemState>>,
}

impl MemCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemCatalogStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCatalogStore").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct MemState {
    local: CatalogTables,
    majority: CatalogTables,
}

impl MemState {
    fn advance_commit_point(&mut self, write_concern: WriteConcern) {
        if write_concern.is_majority() {
            self.majority = self.local.clone();
        }
    }

    fn view(&self, read_concern: ReadConcern) -> &CatalogTables {
        match read_concern {
            ReadConcern::Local => &self.local,
            ReadConcern::Majority => &self.majority,
        }
    }
}

/// Only committed transactions are recorded.
#[derive(Debug, Clone)]
struct SessionRecord {
    txn_number: TxnNumber,
    stmt_results: BTreeMap<StmtId, WriteResult>,
}

#[derive(Debug, Default, Clone)]
struct CatalogTables {
    collections: BTreeMap<NamespaceString, CollectionCatalogEntry>,
    chunks: Vec<ChunkEntry>,
    placement_history: Vec<PlacementHistoryEntry>,
    index_catalog: Vec<IndexCatalogEntry>,
    tags: Vec<TagEntry>,
    query_analyzers: Vec<QueryAnalyzerEntry>,
    recovery_documents: BTreeMap<RecoveryDocumentId, RecoveryDocument>,
    noop_counter: u64,
    sessions: HashMap<SessionId, SessionRecord>,
}

impl CatalogTables {
    fn apply(&mut self, op: CatalogWriteOp, in_transaction: bool) -> Result<WriteResult> {
        let n = match op {
            CatalogWriteOp::InsertCollection(entry) => {
                if self.collections.contains_key(&entry.nss) {
                    return Err(CatalogError::NamespaceExists(entry.nss));
                }
                self.collections.insert(entry.nss.clone(), entry);
                1
            }
            CatalogWriteOp::DeleteCollection { nss, uuid } => {
                if !in_transaction {
                    return Err(CatalogError::IllegalOperation(format!(
                        "the catalog entry of {nss} can only be deleted by a transaction that \
                        also records the drop in the placement history"
                    )));
                }
                match self.collections.get(&nss) {
                    Some(entry) if entry.uuid == uuid => {
                        self.collections.remove(&nss);
                        1
                    }
                    _ => 0,
                }
            }
            CatalogWriteOp::UpdateAllowMigrations {
                nss,
                expected_uuid,
                allow,
            } => {
                let Some(entry) = self.collections.get_mut(&nss) else {
                    return Err(CatalogError::NamespaceNotSharded(nss));
                };
                if let Some(expected) = expected_uuid {
                    if expected != entry.uuid {
                        return Err(CatalogError::ConflictingOperation {
                            nss,
                            reason: format!(
                                "collection uuid {} does not match the expected {expected}",
                                entry.uuid
                            ),
                        });
                    }
                }
                entry.allow_migrations = allow;
                let uuid = entry.uuid;
                let newest = self
                    .chunks
                    .iter_mut()
                    .filter(|c| c.collection_uuid == uuid)
                    .max_by_key(|c| (c.version.major, c.version.minor));
                if let Some(chunk) = newest {
                    chunk.version = chunk.version.inc_minor();
                }
                1
            }
            CatalogWriteOp::InsertChunks(chunks) => {
                let n = chunks.len();
                self.chunks.extend(chunks);
                n as u64
            }
            CatalogWriteOp::ReplaceChunks { uuid, chunks } => {
                self.chunks.retain(|c| c.collection_uuid != uuid);
                let n = chunks.len();
                self.chunks.extend(chunks);
                n as u64
            }
            CatalogWriteOp::DeleteChunks { uuid } => {
                retain_counting(&mut self.chunks, |c| c.collection_uuid != uuid)
            }
            CatalogWriteOp::InsertPlacementHistory(entry) => {
                if let Some(newer) = self
                    .placement_history
                    .iter()
                    .find(|e| e.uuid == entry.uuid && e.timestamp >= entry.timestamp)
                {
                    return Err(CatalogError::IllegalOperation(format!(
                        "placement history of {} must be strictly increasing in time, {} \
                        is not after {}",
                        entry.uuid, entry.timestamp, newer.timestamp
                    )));
                }
                self.placement_history.push(entry);
                1
            }
            CatalogWriteOp::InsertIndexEntries(entries) => {
                let n = entries.len();
                self.index_catalog.extend(entries);
                n as u64
            }
            CatalogWriteOp::DeleteIndexEntries { uuid } => {
                retain_counting(&mut self.index_catalog, |e| e.collection_uuid != uuid)
            }
            CatalogWriteOp::InsertTags(tags) => {
                let n = tags.len();
                self.tags.extend(tags);
                n as u64
            }
            CatalogWriteOp::DeleteTags { nss } => retain_counting(&mut self.tags, |t| t.nss != nss),
            CatalogWriteOp::InsertQueryAnalyzer(entry) => {
                self.query_analyzers.push(entry);
                1
            }
            CatalogWriteOp::DeleteQueryAnalyzers(filter) => {
                retain_counting(&mut self.query_analyzers, |e| !filter.matches(e))
            }
            CatalogWriteOp::UpsertRecoveryDocument(doc) => {
                self.recovery_documents.insert(doc.id.clone(), doc);
                1
            }
            CatalogWriteOp::DeleteRecoveryDocument(id) => {
                u64::from(self.recovery_documents.remove(&id).is_some())
            }
            CatalogWriteOp::NoopWrite => {
                self.noop_counter += 1;
                1
            }
        };
        Ok(WriteResult::new(n))
    }
}

fn retain_counting<T>(rows: &mut Vec<T>, keep: impl Fn(&T) -> bool) -> u64 {
    let before = rows.len();
    rows.retain(keep);
    (before - rows.len()) as u64
}

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
enum MemTxnInner {
    Active {
        guard: OwnedMutexGuard<MemState>,
        stage: CatalogTables,
        stmt_results: BTreeMap<StmtId, WriteResult>,
        dropped_collections: Vec<CollectionUuid>,
        recorded_placements: Vec<CollectionUuid>,
    },
    /// The transaction committed before, statements return what they returned back then.
    Replay {
        guard: OwnedMutexGuard<MemState>,
        stmt_results: BTreeMap<StmtId, WriteResult>,
    },
}

#[derive(Debug)]
struct MemTxn {
    osi: OperationSessionInfo,
    inner: MemTxnInner,
    finalized: bool,
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(osi = %self.osi, "dropping catalog transaction without commit or abort");
        }
    }
}

#[async_trait]
impl CatalogTransaction for MemTxn {
    async fn run_crud_op(&mut self, op: CatalogWriteOp, stmt_id: StmtId) -> Result<WriteResult> {
        match &mut self.inner {
            MemTxnInner::Active {
                stage,
                stmt_results,
                dropped_collections,
                recorded_placements,
                ..
            } => {
                let dropping = match &op {
                    CatalogWriteOp::DeleteCollection { uuid, .. } => Some(*uuid),
                    _ => None,
                };
                if let CatalogWriteOp::InsertPlacementHistory(entry) = &op {
                    recorded_placements.push(entry.uuid);
                }
                let name = op.name();
                let result = stage.apply(op, true)?;
                if let Some(uuid) = dropping.filter(|_| result.n > 0) {
                    dropped_collections.push(uuid);
                }
                debug!(
                    osi = %self.osi,
                    %stmt_id,
                    op = name,
                    n = result.n,
                    "applied catalog statement"
                );
                stmt_results.insert(stmt_id, result);
                Ok(result)
            }
            MemTxnInner::Replay { stmt_results, .. } => {
                let result = stmt_results.get(&stmt_id).copied().ok_or_else(|| {
                    CatalogError::IncompleteTransactionHistory {
                        session_id: self.osi.session_id,
                        txn_number: self.osi.txn_number,
                        stmt_id,
                    }
                })?;
                debug!(osi = %self.osi, %stmt_id, n = result.n, "replayed catalog statement");
                Ok(result)
            }
        }
    }

    async fn commit(mut self: Box<Self>, write_concern: WriteConcern) -> Result<()> {
        self.finalized = true;
        let osi = self.osi;
        match &mut self.inner {
            MemTxnInner::Active {
                guard,
                stage,
                stmt_results,
                dropped_collections,
                recorded_placements,
            } => {
                if let Some(uuid) = dropped_collections
                    .iter()
                    .find(|uuid| !recorded_placements.contains(uuid))
                {
                    return Err(CatalogError::IllegalOperation(format!(
                        "transaction {osi} deleted the catalog entry of collection {uuid} \
                        without recording the drop in the placement history"
                    )));
                }
                stage.sessions.insert(
                    osi.session_id,
                    SessionRecord {
                        txn_number: osi.txn_number,
                        stmt_results: std::mem::take(stmt_results),
                    },
                );
                guard.local = std::mem::take(stage);
                guard.advance_commit_point(write_concern);
                debug!(%osi, ?write_concern, "committed catalog transaction");
            }
            MemTxnInner::Replay { guard, .. } => {
                guard.advance_commit_point(write_concern);
                debug!(%osi, "catalog transaction already committed");
            }
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.finalized = true;
        debug!(osi = %self.osi, "aborted catalog transaction");
    }
}

#[async_trait]
impl CatalogStore for MemCatalogStore {
    async fn start_transaction(
        &self,
        osi: OperationSessionInfo,
    ) -> Result<Box<dyn CatalogTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let inner = match guard.local.sessions.get(&osi.session_id) {
            Some(record) if record.txn_number > osi.txn_number => {
                return Err(CatalogError::TransactionTooOld {
                    session_id: osi.session_id,
                    txn_number: osi.txn_number,
                    current: record.txn_number,
                });
            }
            Some(record) if record.txn_number == osi.txn_number => {
                let stmt_results = record.stmt_results.clone();
                MemTxnInner::Replay {
                    guard,
                    stmt_results,
                }
            }
            _ => {
                let stage = guard.local.clone();
                MemTxnInner::Active {
                    guard,
                    stage,
                    stmt_results: BTreeMap::new(),
                    dropped_collections: vec![],
                    recorded_placements: vec![],
                }
            }
        };
        Ok(Box::new(MemTxn {
            osi,
            inner,
            finalized: false,
        }))
    }

    async fn write(&self, op: CatalogWriteOp, write_concern: WriteConcern) -> Result<WriteResult> {
        let mut state = self.state.lock().await;
        let name = op.name();
        let result = state.local.apply(op, false)?;
        state.advance_commit_point(write_concern);
        debug!(op = name, n = result.n, ?write_concern, "applied catalog write");
        Ok(result)
    }

    async fn find_collection(
        &self,
        nss: &NamespaceString,
        read_concern: ReadConcern,
    ) -> Result<Option<CollectionCatalogEntry>> {
        let state = self.state.lock().await;
        Ok(state.view(read_concern).collections.get(nss).cloned())
    }

    async fn collections(&self, read_concern: ReadConcern) -> Result<Vec<CollectionCatalogEntry>> {
        let state = self.state.lock().await;
        Ok(state.view(read_concern).collections.values().cloned().collect())
    }

    async fn chunks(
        &self,
        uuid: CollectionUuid,
        read_concern: ReadConcern,
    ) -> Result<Vec<ChunkEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .view(read_concern)
            .chunks
            .iter()
            .filter(|c| c.collection_uuid == uuid)
            .cloned()
            .collect())
    }

    async fn placement_history(
        &self,
        nss: &NamespaceString,
        read_concern: ReadConcern,
    ) -> Result<Vec<PlacementHistoryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .view(read_concern)
            .placement_history
            .iter()
            .filter(|e| &e.nss == nss)
            .cloned()
            .collect())
    }

    async fn index_entries(
        &self,
        uuid: CollectionUuid,
        read_concern: ReadConcern,
    ) -> Result<Vec<IndexCatalogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .view(read_concern)
            .index_catalog
            .iter()
            .filter(|e| e.collection_uuid == uuid)
            .cloned()
            .collect())
    }

    async fn tags(
        &self,
        nss: &NamespaceString,
        read_concern: ReadConcern,
    ) -> Result<Vec<TagEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .view(read_concern)
            .tags
            .iter()
            .filter(|t| &t.nss == nss)
            .cloned()
            .collect())
    }

    async fn query_analyzers(&self, read_concern: ReadConcern) -> Result<Vec<QueryAnalyzerEntry>> {
        let state = self.state.lock().await;
        Ok(state.view(read_concern).query_analyzers.clone())
    }

    async fn recovery_documents(
        &self,
        read_concern: ReadConcern,
    ) -> Result<Vec<RecoveryDocument>> {
        let state = self.state.lock().await;
        Ok(state
            .view(read_concern)
            .recovery_documents
            .values()
            .cloned()
            .collect())
    }

    async fn noop_write_count(&self, read_concern: ReadConcern) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.view(read_concern).noop_counter)
    }
}
