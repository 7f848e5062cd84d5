//! The contract between [`DdlCoordinatorService`](crate::service::DdlCoordinatorService) and the
//! DDL operations it runs.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use metric::Registry;
use shardkeeper_catalog::{CatalogStore, CatalogWriteOp, RecoveryDocument, RecoveryDocumentId};
use shardkeeper_types::{ClusterClock, WriteConcern};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DdlError, Result},
    lock_manager::{DdlLockManager, LockMode, LockRequest, ResourceId},
    participants::ShardClient,
};

/// Tunables of the DDL layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DdlArgs {
    /// How long a DDL lock request waits for recovery and for conflicting holders.
    pub lock_timeout: Duration,
    /// Issue a majority no-op write before reading recovery documents on step-up.
    pub linearize_recovery_reads: bool,
    /// Pause between attempts after a retryable error.
    pub retry_backoff: Duration,
}

impl Default for DdlArgs {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5 * 60),
            linearize_recovery_reads: true,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// A DDL operation whose progress is kept in a recovery document so that a new primary can
/// finish it.
#[async_trait]
pub trait DdlCoordinator: Debug + Send + Sync + 'static {
    fn id(&self) -> &RecoveryDocumentId;

    /// The current state, as it would be persisted.
    fn recovery_document(&self) -> Result<RecoveryDocument>;

    /// Whether a request for `other` can be served by this running instance.
    fn is_equivalent(&self, other: &RecoveryDocument) -> bool;

    /// Drive the operation to completion. The recovery document is removed on success and on
    /// non-retryable failure, and kept when interrupted by a step-down.
    async fn run(self: Arc<Self>, ctx: CoordinatorContext) -> Result<()>;
}

/// Builds coordinators of one kind from their recovery documents.
pub trait CoordinatorFactory: Debug + Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn build(&self, doc: RecoveryDocument) -> Result<Arc<dyn DdlCoordinator>>;
}

/// Everything a running coordinator may use.
#[derive(Debug, Clone)]
pub struct CoordinatorContext {
    pub store: Arc<dyn CatalogStore>,
    pub lock_manager: Arc<DdlLockManager>,
    pub shards: Arc<dyn ShardClient>,
    pub clock: Arc<ClusterClock>,
    pub metric_registry: Arc<Registry>,
    pub args: DdlArgs,
    /// Cancelled when the node steps down.
    pub cancel: CancellationToken,
    /// Set for coordinators rebuilt during step-up recovery.
    pub resumed_from_recovery: bool,
}

impl CoordinatorContext {
    /// A lock request with the configured timeout, interrupted when this coordinator's term ends.
    /// Resumed coordinators skip the recovery gate, they are what recovery waits for.
    pub fn lock_request(
        &self,
        resource: ResourceId,
        mode: LockMode,
        reason: impl Into<String>,
    ) -> LockRequest {
        let request = LockRequest::new(resource, mode, reason)
            .with_timeout(self.args.lock_timeout)
            .with_interrupt(self.cancel.clone());
        if self.resumed_from_recovery {
            request.bypass_recovery_wait()
        } else {
            request
        }
    }

    pub async fn persist(&self, doc: RecoveryDocument) -> Result<()> {
        self.store
            .write(
                CatalogWriteOp::UpsertRecoveryDocument(doc),
                WriteConcern::Majority,
            )
            .await?;
        Ok(())
    }

    pub async fn remove_document(&self, id: &RecoveryDocumentId) -> Result<()> {
        self.store
            .write(
                CatalogWriteOp::DeleteRecoveryDocument(id.clone()),
                WriteConcern::Majority,
            )
            .await?;
        Ok(())
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep for the retry backoff, failing early on step-down.
    pub async fn backoff(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DdlError::NotWritablePrimary),
            _ = tokio::time::sleep(self.args.retry_backoff) => Ok(()),
        }
    }
}
