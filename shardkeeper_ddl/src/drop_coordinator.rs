//! Drop of a (sharded or unsharded) collection across the cluster.
//!
//! Progress is persisted before every phase so a new primary resumes where the previous one
//! stopped. Every step that touches a shard or the catalog under the coordinator's session first
//! persists a fresh transaction number, so attempts made by an earlier primary are fenced off.

use std::sync::Arc;

use async_trait::async_trait;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardkeeper_catalog::{QueryAnalyzerFilter, RecoveryDocument, RecoveryDocumentId};
use shardkeeper_types::{
    CollectionUuid, NamespaceString, OperationSessionInfo, ReadConcern, SessionId, TxnNumber,
};

use crate::{
    coordinator::{CoordinatorContext, CoordinatorFactory, DdlCoordinator},
    error::{DdlError, Result},
    lock_manager::{LockMode, ResourceId},
    util::{
        perform_noop_retryable_write_on_shards, remove_coll_and_chunks_metadata,
        remove_query_analyzer_metadata, remove_tags_metadata, send_drop_collection_participant,
        stop_migrations,
    },
};

pub const DROP_COLLECTION_KIND: &str = "dropCollection";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DropCollectionPhase {
    Unset,
    FreezeCollection,
    DropCollection,
    ReleaseCriticalSection,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DropCollectionState {
    phase: DropCollectionPhase,
    #[serde(default)]
    collection_uuid: Option<CollectionUuid>,
    session_id: SessionId,
    txn_number: TxnNumber,
}

impl DropCollectionState {
    fn to_document(self, id: &RecoveryDocumentId) -> Result<RecoveryDocument> {
        let payload = serde_json::to_value(self)
            .map_err(|e| DdlError::MalformedRecoveryDocument(format!("{id}: {e}")))?;
        Ok(RecoveryDocument {
            id: id.clone(),
            payload,
        })
    }
}

/// The document that requests a drop of `nss`.
pub fn drop_collection_request(nss: NamespaceString) -> RecoveryDocument {
    let id = RecoveryDocumentId {
        nss,
        kind: DROP_COLLECTION_KIND.to_string(),
    };
    let state = DropCollectionState {
        phase: DropCollectionPhase::Unset,
        collection_uuid: None,
        session_id: SessionId::new(),
        txn_number: TxnNumber::new(0),
    };
    RecoveryDocument {
        payload: serde_json::json!({
            "phase": state.phase,
            "sessionId": state.session_id,
            "txnNumber": state.txn_number,
        }),
        id,
    }
}

#[derive(Debug)]
pub struct DropCollectionCoordinator {
    id: RecoveryDocumentId,
    state: Mutex<DropCollectionState>,
}

impl DropCollectionCoordinator {
    pub fn phase(&self) -> DropCollectionPhase {
        self.state.lock().phase
    }

    fn nss(&self) -> &NamespaceString {
        &self.id.nss
    }

    /// Persist `f` applied to the current state, then make it current.
    async fn update(
        &self,
        ctx: &CoordinatorContext,
        f: impl FnOnce(&mut DropCollectionState) + Send,
    ) -> Result<DropCollectionState> {
        let mut next = *self.state.lock();
        f(&mut next);
        ctx.persist(next.to_document(&self.id)?).await?;
        *self.state.lock() = next;
        Ok(next)
    }

    /// Whether the work of `phase` still has to run.
    async fn enter_phase(
        &self,
        ctx: &CoordinatorContext,
        phase: DropCollectionPhase,
    ) -> Result<bool> {
        let current = self.phase();
        if current > phase {
            return Ok(false);
        }
        if current < phase {
            self.update(ctx, |s| s.phase = phase).await?;
            debug!(nss = %self.nss(), ?phase, "drop collection coordinator entered phase");
        }
        Ok(true)
    }

    async fn next_session(&self, ctx: &CoordinatorContext) -> Result<OperationSessionInfo> {
        let state = self
            .update(ctx, |s| s.txn_number = s.txn_number.next())
            .await?;
        Ok(OperationSessionInfo::new(state.session_id, state.txn_number))
    }

    async fn run_phases(&self, ctx: &CoordinatorContext) -> Result<()> {
        if self
            .enter_phase(ctx, DropCollectionPhase::FreezeCollection)
            .await?
        {
            self.freeze_collection(ctx).await?;
        }
        if self
            .enter_phase(ctx, DropCollectionPhase::DropCollection)
            .await?
        {
            self.drop_collection(ctx).await?;
        }
        if self
            .enter_phase(ctx, DropCollectionPhase::ReleaseCriticalSection)
            .await?
        {
            self.release_critical_section(ctx).await?;
        }
        Ok(())
    }

    async fn freeze_collection(&self, ctx: &CoordinatorContext) -> Result<()> {
        let nss = self.nss();
        let uuid = ctx
            .store
            .find_collection(nss, ReadConcern::Majority)
            .await?
            .map(|entry| entry.uuid);
        self.update(ctx, |s| s.collection_uuid = uuid).await?;

        match uuid {
            Some(uuid) => {
                stop_migrations(ctx.store.as_ref(), nss, Some(uuid)).await?;
            }
            None => info!(%nss, "collection is not sharded, dropping it on the shards only"),
        }
        Ok(())
    }

    async fn drop_collection(&self, ctx: &CoordinatorContext) -> Result<()> {
        let nss = self.nss();
        let shard_ids = ctx.shards.shard_ids();

        let osi = self.next_session(ctx).await?;
        send_drop_collection_participant(ctx.shards.as_ref(), nss, &shard_ids, osi, false).await?;

        let collection_uuid = self.state.lock().collection_uuid;
        if let Some(uuid) = collection_uuid {
            let osi = self.next_session(ctx).await?;
            remove_coll_and_chunks_metadata(
                ctx.store.as_ref(),
                &ctx.clock,
                &ctx.metric_registry,
                nss,
                uuid,
                osi,
                &ctx.cancel,
            )
            .await?;
        }

        let osi = self.next_session(ctx).await?;
        remove_tags_metadata(ctx.store.as_ref(), nss, osi).await?;
        remove_query_analyzer_metadata(
            ctx.store.as_ref(),
            QueryAnalyzerFilter::Namespace(nss.clone()),
        )
        .await?;

        info!(%nss, shards = shard_ids.len(), "collection dropped");
        Ok(())
    }

    async fn release_critical_section(&self, ctx: &CoordinatorContext) -> Result<()> {
        let osi = self.next_session(ctx).await?;
        perform_noop_retryable_write_on_shards(ctx.shards.as_ref(), &ctx.shards.shard_ids(), osi)
            .await
    }

    async fn run_with_retries(&self, ctx: &CoordinatorContext) -> Result<()> {
        loop {
            match self.run_phases(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && !ctx.is_interrupted() => {
                    warn!(
                        nss = %self.nss(),
                        phase = ?self.phase(),
                        error = %e,
                        "drop collection coordinator hit a retryable error"
                    );
                    ctx.backoff().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the recovery document unless the coordinator was interrupted by a step-down.
    async fn finish(&self, ctx: &CoordinatorContext, res: Result<()>) -> Result<()> {
        match res {
            Err(e) if ctx.is_interrupted() => {
                info!(
                    nss = %self.nss(),
                    phase = ?self.phase(),
                    "drop collection coordinator interrupted, the next primary resumes it"
                );
                Err(e)
            }
            res => {
                if let Err(e) = &res {
                    warn!(nss = %self.nss(), error = %e, "drop collection failed");
                }
                ctx.remove_document(&self.id).await?;
                res
            }
        }
    }
}

#[async_trait]
impl DdlCoordinator for DropCollectionCoordinator {
    fn id(&self) -> &RecoveryDocumentId {
        &self.id
    }

    fn recovery_document(&self) -> Result<RecoveryDocument> {
        let state = *self.state.lock();
        state.to_document(&self.id)
    }

    fn is_equivalent(&self, other: &RecoveryDocument) -> bool {
        other.id == self.id
    }

    async fn run(self: Arc<Self>, ctx: CoordinatorContext) -> Result<()> {
        info!(
            nss = %self.nss(),
            phase = ?self.phase(),
            resumed = ctx.resumed_from_recovery,
            "drop collection coordinator running"
        );
        let request = ctx.lock_request(
            ResourceId::Collection(self.nss().clone()),
            LockMode::Exclusive,
            DROP_COLLECTION_KIND,
        );
        let lock = match ctx.lock_manager.acquire(request).await {
            Ok(lock) => lock,
            Err(e) => return self.finish(&ctx, Err(e)).await,
        };

        let res = self.run_with_retries(&ctx).await;
        let res = self.finish(&ctx, res).await;
        drop(lock);
        res
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DropCollectionCoordinatorFactory;

impl CoordinatorFactory for DropCollectionCoordinatorFactory {
    fn kind(&self) -> &'static str {
        DROP_COLLECTION_KIND
    }

    fn build(&self, doc: RecoveryDocument) -> Result<Arc<dyn DdlCoordinator>> {
        if doc.id.kind != DROP_COLLECTION_KIND {
            return Err(DdlError::MalformedRecoveryDocument(format!(
                "{} is not a {DROP_COLLECTION_KIND} document",
                doc.id
            )));
        }
        let state: DropCollectionState = serde_json::from_value(doc.payload)
            .map_err(|e| DdlError::MalformedRecoveryDocument(format!("{}: {e}", doc.id)))?;
        Ok(Arc::new(DropCollectionCoordinator {
            id: doc.id,
            state: Mutex::new(state),
        }))
    }
}
