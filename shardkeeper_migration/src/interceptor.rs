//! The write-path observer that keeps in-progress chunk migrations in sync with user writes.

use std::sync::Arc;

use observability_deps::tracing::{info, trace};
use shardkeeper_types::{Document, DocumentKey, NamespaceString, OpTime, Timestamp};

use crate::{
    cloner::MigrationClonerSession,
    error::{Result, WriteError},
    op_observer::{OpObserver, UpdateArgs},
    ownership::assert_intersecting_chunk_has_not_moved,
    sharding_state::{CollectionMetadata, ShardingStateRegistry, ShardingWriteRouter},
    side_channel::SideChannelValue,
    transaction_handler::{ForwardWrite, ForwardedWrite, TransactionHandler},
    write_context::{TransactionOperation, WriteContext},
};

/// Checks every write against the sharding state of its collection and forwards the writes that
/// hit a migrating chunk to the migration's cloner once they commit.
///
/// * Writes applied by a migration and writes to the session table are ignored.
/// * Versioned writes must match the shard (or, for unsharded collections, database) version.
/// * Unsharded collections only reject writes while their database primary moves.
/// * Inside a transaction reading at a fixed cluster time, inserted and updated documents must
///   still belong to a chunk this shard owned at that time. Transaction writes are forwarded once,
///   in order, when the transaction commits or prepares.
/// * Outside a transaction, inserts and updates are forwarded to the active cloner, deletes only if
///   the document was inside the migrating chunk when it was about to be deleted.
#[derive(Debug)]
pub struct MigrationWriteInterceptor {
    sharding_state: Arc<ShardingStateRegistry>,
}

impl MigrationWriteInterceptor {
    pub fn new(sharding_state: Arc<ShardingStateRegistry>) -> Self {
        Self { sharding_state }
    }

    /// Router attached by an earlier observer, or a fresh one.
    fn router(&self, ctx: &WriteContext, nss: &NamespaceString) -> Arc<ShardingWriteRouter> {
        match ctx.side_channel().sharding_write_router() {
            Some(router) if router.collection().nss() == nss => Arc::clone(router),
            _ => Arc::new(ShardingWriteRouter::new(&self.sharding_state, nss)),
        }
    }

    /// Metadata of the collection if the write needs migration handling.
    fn check_write(
        &self,
        ctx: &WriteContext,
        nss: &NamespaceString,
        router: &ShardingWriteRouter,
    ) -> Result<Option<Arc<CollectionMetadata>>> {
        if ctx.is_from_migrate() || nss.is_session_transactions_table() {
            return Ok(None);
        }

        let metadata = router
            .collection()
            .check_shard_version_or_throw(ctx.shard_version(nss))?;
        if metadata.is_sharded() {
            return Ok(Some(metadata));
        }

        let database = router.database();
        database.assert_matching_db_version(ctx.db_version(nss.db_name()))?;
        if database.is_move_primary_in_progress()
            && (nss.is_normal_collection()
                || nss.is_system_views()
                || nss.is_timeseries_buckets_collection())
        {
            info!(%nss, "rejecting write, move primary in progress");
            return Err(WriteError::MovePrimaryInProgress(nss.clone()));
        }
        Ok(None)
    }

    fn defer(
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        cloner: &Arc<MigrationClonerSession>,
        write: ForwardedWrite,
    ) -> Result<()> {
        let op_time = ctx
            .op_time()
            .ok_or_else(|| WriteError::MissingOpTime(nss.clone()))?;
        trace!(%nss, session = %cloner.id(), ?op_time, "deferring write for migration");
        ctx.recovery_unit_mut().register_change(Box::new(ForwardWrite {
            cloner: Arc::<MigrationClonerSession>::clone(cloner),
            op_time,
            write,
        }));
        Ok(())
    }

    fn register_transaction_handler(
        &self,
        ctx: &mut WriteContext,
        operations: &[TransactionOperation],
        op_time: Option<OpTime>,
    ) -> Result<()> {
        let Some(first) = operations.first() else {
            return Ok(());
        };
        let op_time = op_time.ok_or_else(|| WriteError::MissingOpTime(first.nss.clone()))?;
        ctx.recovery_unit_mut()
            .register_change(Box::new(TransactionHandler::new(
                Arc::clone(&self.sharding_state),
                operations.to_vec(),
                op_time,
            )));
        Ok(())
    }
}

fn snapshot_time(ctx: &WriteContext) -> Option<Timestamp> {
    ctx.transaction().and_then(|txn| txn.at_cluster_time)
}

fn assert_owner_unchanged(
    metadata: &CollectionMetadata,
    doc: &Document,
    at: Timestamp,
) -> Result<()> {
    let Some(cm) = metadata.chunk_manager() else {
        return Ok(());
    };
    let key = cm.key_pattern().extract_shard_key_from_doc(doc)?;
    assert_intersecting_chunk_has_not_moved(metadata, &key, at)
}

impl OpObserver for MigrationWriteInterceptor {
    fn name(&self) -> &'static str {
        "migration"
    }

    fn on_insert(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        doc: &Document,
    ) -> Result<()> {
        let router = self.router(ctx, nss);
        let Some(metadata) = self.check_write(ctx, nss, &router)? else {
            return Ok(());
        };

        if ctx.transaction().is_some() {
            if let Some(at) = snapshot_time(ctx) {
                assert_owner_unchanged(&metadata, doc, at)?;
            }
            return Ok(());
        }

        match router.cloner() {
            Some(cloner) => Self::defer(ctx, nss, cloner, ForwardedWrite::Insert(doc.clone())),
            None => Ok(()),
        }
    }

    fn on_update(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        args: &UpdateArgs,
    ) -> Result<()> {
        let router = self.router(ctx, nss);
        let Some(metadata) = self.check_write(ctx, nss, &router)? else {
            return Ok(());
        };

        if ctx.transaction().is_some() {
            if let Some(at) = snapshot_time(ctx) {
                assert_owner_unchanged(&metadata, &args.post_image, at)?;
            }
            return Ok(());
        }

        match router.cloner() {
            Some(cloner) => Self::defer(
                ctx,
                nss,
                cloner,
                ForwardedWrite::Update {
                    pre_image: args.pre_image.clone(),
                    post_image: args.post_image.clone(),
                },
            ),
            None => Ok(()),
        }
    }

    fn about_to_delete(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        doc: &Document,
    ) -> Result<()> {
        let is_migrating = !ctx.is_from_migrate()
            && self
                .router(ctx, nss)
                .cloner()
                .is_some_and(|cloner| cloner.is_document_in_migrating_chunk(doc));
        ctx.side_channel_mut()
            .insert(SideChannelValue::AboutToDelete { is_migrating });
        Ok(())
    }

    fn on_delete(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        document_key: &DocumentKey,
    ) -> Result<()> {
        let is_migrating = ctx
            .side_channel_mut()
            .take_about_to_delete()
            .unwrap_or(false);
        let router = self.router(ctx, nss);
        if self.check_write(ctx, nss, &router)?.is_none()
            || ctx.transaction().is_some()
            || !is_migrating
        {
            return Ok(());
        }

        match router.cloner() {
            Some(cloner) => Self::defer(
                ctx,
                nss,
                cloner,
                ForwardedWrite::Delete(document_key.clone()),
            ),
            None => Ok(()),
        }
    }

    fn on_unprepared_transaction_commit(
        &self,
        ctx: &mut WriteContext,
        operations: &[TransactionOperation],
    ) -> Result<()> {
        let op_time = ctx.op_time();
        self.register_transaction_handler(ctx, operations, op_time)
    }

    fn on_transaction_prepare(
        &self,
        ctx: &mut WriteContext,
        operations: &[TransactionOperation],
    ) -> Result<()> {
        let op_time = ctx.op_time();
        self.register_transaction_handler(ctx, operations, op_time)
    }

    fn on_transaction_prepare_non_primary(
        &self,
        ctx: &mut WriteContext,
        operations: &[TransactionOperation],
        prepare_op_time: OpTime,
    ) -> Result<()> {
        self.register_transaction_handler(ctx, operations, Some(prepare_op_time))
    }
}
