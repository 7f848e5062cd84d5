//! Registry of running DDL coordinators and the step-up recovery that rebuilds them.

use std::sync::Arc;

use hashbrown::HashMap;
use metric::Registry;
use observability_deps::tracing::{error, info, warn};
use parking_lot::Mutex;
use shardkeeper_catalog::{CatalogStore, RecoveryDocument, RecoveryDocumentId};
use shardkeeper_types::{ClusterClock, ReadConcern};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    coordinator::{CoordinatorContext, CoordinatorFactory, DdlArgs, DdlCoordinator},
    error::{DdlError, Result},
    lock_manager::DdlLockManager,
    metrics::ServiceMetrics,
    participants::ShardClient,
    recovery::{RecoveryState, RecoveryTracker},
    util::linearize_catalog_reads,
};

type Completion = Arc<watch::Sender<Option<Result<()>>>>;

/// Observes the outcome of one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    id: RecoveryDocumentId,
    completion: Completion,
}

impl CoordinatorHandle {
    pub fn id(&self) -> &RecoveryDocumentId {
        &self.id
    }

    /// Wait for the coordinator to finish. A step-down completes it with
    /// [`DdlError::NotWritablePrimary`].
    pub async fn completion(&self) -> Result<()> {
        let mut rx = self.completion.subscribe();
        let res = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DdlError::Interrupted)?;
        match &*res {
            Some(res) => res.clone(),
            None => Err(DdlError::Interrupted),
        }
    }
}

#[derive(Debug)]
struct Instance {
    coordinator: Arc<dyn DdlCoordinator>,
    completion: Completion,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Inner {
    instances: HashMap<RecoveryDocumentId, Instance>,
    recovery_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct DdlCoordinatorService {
    recovery: Arc<RecoveryTracker>,
    lock_manager: Arc<DdlLockManager>,
    store: Arc<dyn CatalogStore>,
    shards: Arc<dyn ShardClient>,
    clock: Arc<ClusterClock>,
    metric_registry: Arc<Registry>,
    args: DdlArgs,
    factories: HashMap<&'static str, Arc<dyn CoordinatorFactory>>,
    inner: Arc<Mutex<Inner>>,
    /// Serializes instance creation so the dedupe check and the insert cannot interleave.
    creation: tokio::sync::Mutex<()>,
    metrics: ServiceMetrics,
}

impl DdlCoordinatorService {
    pub fn new(
        lock_manager: Arc<DdlLockManager>,
        store: Arc<dyn CatalogStore>,
        shards: Arc<dyn ShardClient>,
        clock: Arc<ClusterClock>,
        metric_registry: Arc<Registry>,
        args: DdlArgs,
    ) -> Self {
        let metrics = ServiceMetrics::new(&metric_registry);
        Self {
            recovery: Arc::clone(lock_manager.recovery()),
            lock_manager,
            store,
            shards,
            clock,
            metric_registry,
            args,
            factories: Default::default(),
            inner: Default::default(),
            creation: Default::default(),
            metrics,
        }
    }

    /// Register the factory for one coordinator kind.
    pub fn with_factory(mut self, factory: Arc<dyn CoordinatorFactory>) -> Self {
        self.factories.insert(factory.kind(), factory);
        self
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn lock_manager(&self) -> &Arc<DdlLockManager> {
        &self.lock_manager
    }

    /// Ids of the coordinators currently running.
    pub fn running(&self) -> Vec<RecoveryDocumentId> {
        self.inner.lock().instances.keys().cloned().collect()
    }

    /// Become primary in `term` and start rebuilding the coordinators persisted by previous
    /// primaries in the background.
    pub fn step_up(self: &Arc<Self>, term: i64) {
        self.recovery.on_step_up(term);
        let cancel = self.recovery.interrupt_token();

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.recover(term, cancel).await });

        if let Some(previous) = self.inner.lock().recovery_task.replace(task) {
            previous.abort();
        }
    }

    /// Stop being primary. Every waiter and every running coordinator is interrupted; their
    /// recovery documents stay for the next primary.
    pub fn step_down(&self) {
        self.recovery.on_step_down();

        let mut inner = self.inner.lock();
        if let Some(task) = inner.recovery_task.take() {
            task.abort();
        }
        for (id, instance) in inner.instances.drain() {
            instance.task.abort();
            instance.completion.send_if_modified(|c| {
                if c.is_none() {
                    *c = Some(Err(DdlError::NotWritablePrimary));
                    true
                } else {
                    false
                }
            });
            info!(%id, "DDL coordinator interrupted by step down");
        }
    }

    /// Start the operation described by `doc`, or join the equivalent one already running.
    pub async fn get_or_create_instance(&self, doc: RecoveryDocument) -> Result<CoordinatorHandle> {
        self.recovery.wait_for_recovery_completion().await?;
        let cancel = self.recovery.interrupt_token();

        let factory = self.factory(&doc.id.kind)?;
        let _permit = self.creation.lock().await;

        if let Some(handle) = self.existing_instance(&doc)? {
            return Ok(handle);
        }

        let coordinator = factory.build(doc)?;
        let ctx = self.context(cancel, false);
        ctx.persist(coordinator.recovery_document()?).await?;

        let handle = self.spawn_instance(coordinator, ctx)?;
        info!(id = %handle.id(), "DDL coordinator started");
        Ok(handle)
    }

    fn existing_instance(&self, doc: &RecoveryDocument) -> Result<Option<CoordinatorHandle>> {
        let inner = self.inner.lock();
        let Some(instance) = inner.instances.get(&doc.id) else {
            return Ok(None);
        };
        if instance.coordinator.is_equivalent(doc) {
            Ok(Some(CoordinatorHandle {
                id: doc.id.clone(),
                completion: Arc::clone(&instance.completion),
            }))
        } else {
            Err(DdlError::ConflictingOperation(format!(
                "another {} operation with different arguments is already running on {}",
                doc.id.kind, doc.id.nss
            )))
        }
    }

    fn factory(&self, kind: &str) -> Result<Arc<dyn CoordinatorFactory>> {
        self.factories
            .get(kind)
            .map(Arc::clone)
            .ok_or_else(|| DdlError::CommandFailed(format!("unknown DDL coordinator kind {kind}")))
    }

    fn context(
        &self,
        cancel: CancellationToken,
        resumed_from_recovery: bool,
    ) -> CoordinatorContext {
        CoordinatorContext {
            store: Arc::clone(&self.store),
            lock_manager: Arc::clone(&self.lock_manager),
            shards: Arc::clone(&self.shards),
            clock: Arc::clone(&self.clock),
            metric_registry: Arc::clone(&self.metric_registry),
            args: self.args,
            cancel,
            resumed_from_recovery,
        }
    }

    fn spawn_instance(
        &self,
        coordinator: Arc<dyn DdlCoordinator>,
        ctx: CoordinatorContext,
    ) -> Result<CoordinatorHandle> {
        let id = coordinator.id().clone();
        let (tx, _) = watch::channel(None);
        let completion: Completion = Arc::new(tx);

        let mut inner = self.inner.lock();
        // step-down cancels under the same lock, nothing can be spawned into a stale term
        if ctx.cancel.is_cancelled() {
            return Err(DdlError::NotWritablePrimary);
        }

        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            let completion = Arc::clone(&completion);
            let registry = Arc::clone(&self.inner);
            let id = id.clone();
            async move {
                let res = coordinator.run(ctx).await;
                match &res {
                    Ok(()) => info!(%id, "DDL coordinator completed"),
                    Err(e) => warn!(%id, error = %e, "DDL coordinator failed"),
                }
                completion.send_replace(Some(res));

                let mut inner = registry.lock();
                if inner
                    .instances
                    .get(&id)
                    .is_some_and(|i| Arc::ptr_eq(&i.completion, &completion))
                {
                    inner.instances.remove(&id);
                }
            }
        });

        inner.instances.insert(
            id.clone(),
            Instance {
                coordinator,
                completion: Arc::clone(&completion),
                task,
            },
        );
        Ok(CoordinatorHandle { id, completion })
    }

    async fn recover(&self, term: i64, cancel: CancellationToken) {
        let coordinators = loop {
            match self.rebuild_coordinators().await {
                Ok(coordinators) => break coordinators,
                Err(e) => {
                    warn!(term, error = %e, "failed to read DDL recovery documents, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.args.retry_backoff) => {}
                    }
                }
            }
        };

        let mut resumed = 0;
        for coordinator in coordinators {
            let id = coordinator.id().clone();
            match self.spawn_instance(coordinator, self.context(cancel.clone(), true)) {
                Ok(_) => {
                    info!(%id, term, "DDL coordinator resumed");
                    resumed += 1;
                }
                Err(_) => return,
            }
        }

        if self.recovery.set_recovered(term) {
            self.metrics.coordinators_recovered.inc(resumed);
            info!(term, resumed, "DDL coordinator recovery complete");
        }
    }

    async fn rebuild_coordinators(&self) -> Result<Vec<Arc<dyn DdlCoordinator>>> {
        if self.args.linearize_recovery_reads {
            linearize_catalog_reads(self.store.as_ref()).await?;
        }
        let docs = self.store.recovery_documents(ReadConcern::Majority).await?;

        let mut coordinators = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id.clone();
            let built = self.factory(&id.kind).and_then(|f| f.build(doc));
            match built {
                Ok(coordinator) => coordinators.push(coordinator),
                Err(e) => error!(%id, error = %e, "skipping unrecoverable DDL coordinator"),
            }
        }
        Ok(coordinators)
    }
}
