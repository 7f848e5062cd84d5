//! Runs named sequences of catalog statements as one retryable transaction.
//!
//! Every statement gets a fixed statement id from its position in the chain, so a retry with the
//! same `(session, txn number)` replays the recorded results instead of applying the statements
//! again. A chain that fails part way is aborted as a whole and the error is returned unchanged:
//! callers retry the entire chain.

use std::fmt::Debug;

use async_trait::async_trait;
use metric::Registry;
use observability_deps::tracing::{debug, info};
use shardkeeper_types::{
    CollectionUuid, NamespaceString, OperationSessionInfo, StmtId, Timestamp, WriteConcern,
};
use tokio_util::sync::CancellationToken;

use crate::{
    entries::PlacementHistoryEntry,
    error::{CatalogError, Result},
    metrics::TransactionMetrics,
    store::{CatalogStore, CatalogTransaction, CatalogWriteOp, WriteResult},
};

/// The statements of one catalog transaction.
#[async_trait]
pub trait TransactionChain: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, txn: &mut dyn CatalogTransaction) -> Result<()>;
}

/// Run `chain` inside the transaction identified by `osi` and commit it with `write_concern`.
///
/// Returns [`CatalogError::Interrupted`] as soon as `cancel` fires; an interrupted transaction is
/// never committed.
pub async fn run_transaction_on_sharding_catalog(
    store: &dyn CatalogStore,
    chain: &dyn TransactionChain,
    osi: OperationSessionInfo,
    write_concern: WriteConcern,
    cancel: &CancellationToken,
) -> Result<()> {
    let work = async {
        let mut txn = store.start_transaction(osi).await?;
        match chain.run(txn.as_mut()).await {
            Ok(()) => txn.commit(write_concern).await,
            Err(e) => {
                txn.abort().await;
                Err(e)
            }
        }
    };

    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CatalogError::Interrupted),
        res = work => res,
    };
    debug!(chain = chain.name(), %osi, ok = res.is_ok(), "ran catalog transaction");
    res
}

/// Run a single statement as a retryable write on `osi`.
pub async fn run_retryable_write(
    store: &dyn CatalogStore,
    op: CatalogWriteOp,
    osi: OperationSessionInfo,
    stmt_id: StmtId,
    write_concern: WriteConcern,
) -> Result<WriteResult> {
    let mut txn = store.start_transaction(osi).await?;
    match txn.run_crud_op(op, stmt_id).await {
        Ok(res) => {
            txn.commit(write_concern).await?;
            Ok(res)
        }
        Err(e) => {
            txn.abort().await;
            Err(e)
        }
    }
}

/// Delete the catalog entry of a collection and record the drop in the placement history.
///
/// The entry is only deleted if it still carries `uuid`. If nothing was deleted an earlier
/// attempt already committed, and the placement history insert is skipped so the drop is
/// recorded exactly once.
#[derive(Debug)]
pub struct DeleteCollectionTransaction {
    nss: NamespaceString,
    uuid: CollectionUuid,
    cluster_time: Timestamp,
    metrics: TransactionMetrics,
}

impl DeleteCollectionTransaction {
    pub fn new(
        nss: NamespaceString,
        uuid: CollectionUuid,
        cluster_time: Timestamp,
        metric_registry: &Registry,
    ) -> Self {
        Self {
            nss,
            uuid,
            cluster_time,
            metrics: TransactionMetrics::new(metric_registry),
        }
    }
}

#[async_trait]
impl TransactionChain for DeleteCollectionTransaction {
    fn name(&self) -> &'static str {
        "delete_collection"
    }

    async fn run(&self, txn: &mut dyn CatalogTransaction) -> Result<()> {
        let deleted = txn
            .run_crud_op(
                CatalogWriteOp::DeleteCollection {
                    nss: self.nss.clone(),
                    uuid: self.uuid,
                },
                StmtId::new(0),
            )
            .await?;

        if deleted.n == 0 {
            info!(
                nss = %self.nss,
                uuid = %self.uuid,
                "collection entry already deleted, skipping placement history update"
            );
            self.metrics.short_circuits.inc(1);
            return Ok(());
        }

        txn.run_crud_op(
            CatalogWriteOp::InsertPlacementHistory(PlacementHistoryEntry {
                nss: self.nss.clone(),
                uuid: self.uuid,
                timestamp: self.cluster_time,
                shards: vec![],
            }),
            StmtId::new(1),
        )
        .await?;
        Ok(())
    }
}
