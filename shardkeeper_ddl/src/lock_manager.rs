//! Hierarchical DDL locks over databases and collections.
//!
//! A collection lock also takes the enclosing database lock in the matching intent mode, so a
//! database-wide exclusive lock excludes every collection lock in it. Requests made by anything
//! other than recovering coordinators wait for DDL recovery to finish first.

use std::{fmt::Display, sync::Arc, time::Duration};

use hashbrown::HashMap;
use iox_time::{Time, TimeProvider};
use metric::Registry;
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use shardkeeper_types::{DatabaseName, NamespaceString};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{DdlError, Result},
    metrics::LockMetrics,
    recovery::{RecoveryState, RecoveryTracker, RecoveryWaitError},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible_with(self, other: Self) -> bool {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) | (Shared, Shared) => true,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => false,
        }
    }

    /// Mode to take on the parent resource.
    pub fn intent(self) -> Self {
        match self {
            Self::IntentShared | Self::Shared => Self::IntentShared,
            Self::IntentExclusive | Self::Exclusive => Self::IntentExclusive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Database(DatabaseName),
    Collection(NamespaceString),
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(db) => write!(f, "database {db}"),
            Self::Collection(nss) => write!(f, "collection {nss}"),
        }
    }
}

/// Identity of a lock holder. Grants never conflict with other grants of the same owner.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner(Uuid);

impl LockOwner {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlLockInfo {
    pub resource: ResourceId,
    pub mode: LockMode,
    pub reason: String,
    pub owner: LockOwner,
    pub acquired_at: Time,
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub resource: ResourceId,
    pub mode: LockMode,
    pub reason: String,
    pub owner: LockOwner,
    pub timeout: Duration,
    /// Only set by coordinators resumed from their recovery documents.
    pub bypass_recovery_wait: bool,
    /// Token of the term the request was made in. Defaults to the current term's.
    pub interrupt: Option<CancellationToken>,
}

impl LockRequest {
    pub fn new(resource: ResourceId, mode: LockMode, reason: impl Into<String>) -> Self {
        Self {
            resource,
            mode,
            reason: reason.into(),
            owner: LockOwner::new(),
            timeout: Duration::ZERO,
            bypass_recovery_wait: false,
            interrupt: None,
        }
    }

    pub fn with_owner(self, owner: LockOwner) -> Self {
        Self { owner, ..self }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn bypass_recovery_wait(self) -> Self {
        Self {
            bypass_recovery_wait: true,
            ..self
        }
    }

    pub fn with_interrupt(self, interrupt: CancellationToken) -> Self {
        Self {
            interrupt: Some(interrupt),
            ..self
        }
    }
}

#[derive(Debug)]
struct GrantEntry {
    id: u64,
    info: DdlLockInfo,
}

#[derive(Debug, Default)]
struct LockTable {
    grants: HashMap<ResourceId, Vec<GrantEntry>>,
    next_id: u64,
}

impl LockTable {
    fn conflicting(
        &self,
        resource: &ResourceId,
        mode: LockMode,
        owner: LockOwner,
    ) -> Option<&DdlLockInfo> {
        self.grants
            .get(resource)?
            .iter()
            .map(|g| &g.info)
            .find(|held| held.owner != owner && !held.mode.is_compatible_with(mode))
    }
}

#[derive(Debug, Default)]
struct Shared {
    table: Mutex<LockTable>,
    released: Notify,
}

/// One granted lock on one resource, released on drop.
#[derive(Debug)]
struct Grant {
    shared: Arc<Shared>,
    resource: ResourceId,
    id: u64,
}

impl Drop for Grant {
    fn drop(&mut self) {
        {
            let mut table = self.shared.table.lock();
            if let Some(grants) = table.grants.get_mut(&self.resource) {
                grants.retain(|g| g.id != self.id);
                if grants.is_empty() {
                    table.grants.remove(&self.resource);
                }
            }
        }
        debug!(resource = %self.resource, "released DDL lock");
        self.shared.released.notify_waiters();
    }
}

/// A held DDL lock. Dropping it releases the lock and the intent lock on its database.
#[derive(Debug)]
pub struct ScopedDdlLock {
    info: DdlLockInfo,
    _grant: Grant,
    _database_intent: Option<Grant>,
}

impl ScopedDdlLock {
    pub fn info(&self) -> &DdlLockInfo {
        &self.info
    }
}

#[derive(Debug)]
pub struct DdlLockManager {
    shared: Arc<Shared>,
    recovery: Arc<RecoveryTracker>,
    time_provider: Arc<dyn TimeProvider>,
    metrics: LockMetrics,
}

impl DdlLockManager {
    pub fn new(
        recovery: Arc<RecoveryTracker>,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &Registry,
    ) -> Self {
        Self {
            shared: Default::default(),
            recovery,
            time_provider,
            metrics: LockMetrics::new(metric_registry),
        }
    }

    /// Acquire `request.resource` in `request.mode`, waiting at most `request.timeout` for DDL
    /// recovery to finish and for conflicting grants to go away.
    ///
    /// Fails with [`DdlError::LockTimeout`] on timeout, and as soon as the node steps down.
    pub async fn acquire(&self, request: LockRequest) -> Result<ScopedDdlLock> {
        let deadline = Instant::now() + request.timeout;
        let interrupt = request
            .interrupt
            .clone()
            .unwrap_or_else(|| self.recovery.interrupt_token());

        let res = self.acquire_inner(&request, deadline, &interrupt).await;
        match &res {
            Ok(_) => self.metrics.acquisitions.inc(1),
            Err(e) => {
                self.metrics.timeouts.inc(1);
                warn!(
                    resource = %request.resource,
                    mode = ?request.mode,
                    reason = %request.reason,
                    error = %e,
                    "failed to acquire DDL lock"
                );
            }
        }
        res
    }

    async fn acquire_inner(
        &self,
        request: &LockRequest,
        deadline: Instant,
        interrupt: &CancellationToken,
    ) -> Result<ScopedDdlLock> {
        if interrupt.is_cancelled() {
            return Err(timeout_error(
                request,
                &request.resource,
                "interrupted by step down".to_string(),
            ));
        }
        if !request.bypass_recovery_wait && self.recovery.state() != RecoveryState::Recovered {
            if let Err(e) = self.recovery.wait_until_recovered(deadline, interrupt).await {
                let detail = match e {
                    RecoveryWaitError::DeadlineExceeded => {
                        "timed out waiting for DDL recovery to complete"
                    }
                    RecoveryWaitError::SteppedDown => "interrupted by step down",
                };
                return Err(timeout_error(request, &request.resource, detail.to_string()));
            }
        }

        let database_intent = match &request.resource {
            ResourceId::Database(_) => None,
            ResourceId::Collection(nss) => Some(
                self.acquire_one(
                    request,
                    ResourceId::Database(nss.db_name().clone()),
                    request.mode.intent(),
                    deadline,
                    interrupt,
                )
                .await?,
            ),
        };
        let grant = self
            .acquire_one(
                request,
                request.resource.clone(),
                request.mode,
                deadline,
                interrupt,
            )
            .await?;

        Ok(ScopedDdlLock {
            info: DdlLockInfo {
                resource: request.resource.clone(),
                mode: request.mode,
                reason: request.reason.clone(),
                owner: request.owner,
                acquired_at: self.time_provider.now(),
            },
            _grant: grant,
            _database_intent: database_intent,
        })
    }

    async fn acquire_one(
        &self,
        request: &LockRequest,
        resource: ResourceId,
        mode: LockMode,
        deadline: Instant,
        interrupt: &CancellationToken,
    ) -> Result<Grant> {
        loop {
            if interrupt.is_cancelled() {
                return Err(timeout_error(
                    request,
                    &resource,
                    "interrupted by step down".to_string(),
                ));
            }
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            // register for wake ups before looking at the table so a release in between is seen
            notified.as_mut().enable();

            let conflict = {
                let mut table = self.shared.table.lock();
                match table.conflicting(&resource, mode, request.owner) {
                    Some(held) => Some(format!(
                        "held in {:?} mode by {} for '{}'",
                        held.mode, held.owner, held.reason
                    )),
                    None => {
                        let id = table.next_id;
                        table.next_id += 1;
                        table
                            .grants
                            .entry(resource.clone())
                            .or_default()
                            .push(GrantEntry {
                                id,
                                info: DdlLockInfo {
                                    resource: resource.clone(),
                                    mode,
                                    reason: request.reason.clone(),
                                    owner: request.owner,
                                    acquired_at: self.time_provider.now(),
                                },
                            });
                        debug!(%resource, ?mode, reason = %request.reason, "granted DDL lock");
                        return Ok(Grant {
                            shared: Arc::clone(&self.shared),
                            resource,
                            id,
                        });
                    }
                }
            };

            tokio::select! {
                biased;
                _ = interrupt.cancelled() => {
                    return Err(timeout_error(
                        request,
                        &resource,
                        "interrupted by step down".to_string(),
                    ));
                }
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    let detail = conflict.unwrap_or_default();
                    return Err(timeout_error(
                        request,
                        &resource,
                        format!("timed out, lock {detail}"),
                    ));
                }
            }
        }
    }

    /// Every lock currently granted, one entry per resource and holder.
    pub fn held_locks(&self) -> Vec<DdlLockInfo> {
        self.shared
            .table
            .lock()
            .grants
            .values()
            .flatten()
            .map(|g| g.info.clone())
            .collect()
    }

    pub fn recovery(&self) -> &Arc<RecoveryTracker> {
        &self.recovery
    }
}

fn timeout_error(request: &LockRequest, resource: &ResourceId, detail: String) -> DdlError {
    DdlError::LockTimeout {
        resource: resource.clone(),
        mode: request.mode,
        reason: request.reason.clone(),
        detail,
    }
}
