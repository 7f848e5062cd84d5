//! Observers notified of every write before it commits.
//!
//! ```text
//!                 user write
//!                     │
//!                     ▼
//!   ╔═ OpObserverRegistry ══════════════╗
//!   ║  ┌─────────────────────────────┐  ║
//!   ║  │        OplogObserver        │──║──▶ ReplicationLog
//!   ║  └─────────────────────────────┘  ║
//!   ║                 │ op time,        ║
//!   ║                 ▼ write router    ║
//!   ║  ┌─────────────────────────────┐  ║
//!   ║  │  MigrationWriteInterceptor  │──║──▶ RecoveryUnit ─ ─ ▶ cloner
//!   ║  └─────────────────────────────┘  ║    (on commit)
//!   ╚═══════════════════════════════════╝
//! ```
//!
//! Observers run in registration order and share the [`WriteContext`] of the write. The first
//! observer to fail aborts the rest of the chain and the write.

use std::{fmt::Debug, sync::Arc};

use shardkeeper_types::{Document, DocumentKey, NamespaceString, OpTime};

use crate::{
    error::{Result, WriteError},
    write_context::{TransactionOperation, WriteContext},
};

/// Images of a document modified by an update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateArgs {
    pub pre_image: Option<Document>,
    pub post_image: Document,
}

/// A participant in the write path. Every hook defaults to doing nothing.
pub trait OpObserver: Debug + Send + Sync {
    /// Name used when reporting a failure of this observer.
    fn name(&self) -> &'static str;

    fn on_insert(
        &self,
        _ctx: &mut WriteContext,
        _nss: &NamespaceString,
        _doc: &Document,
    ) -> Result<()> {
        Ok(())
    }

    fn on_update(
        &self,
        _ctx: &mut WriteContext,
        _nss: &NamespaceString,
        _args: &UpdateArgs,
    ) -> Result<()> {
        Ok(())
    }

    /// Called with the full document before it is deleted.
    fn about_to_delete(
        &self,
        _ctx: &mut WriteContext,
        _nss: &NamespaceString,
        _doc: &Document,
    ) -> Result<()> {
        Ok(())
    }

    fn on_delete(
        &self,
        _ctx: &mut WriteContext,
        _nss: &NamespaceString,
        _document_key: &DocumentKey,
    ) -> Result<()> {
        Ok(())
    }

    fn on_unprepared_transaction_commit(
        &self,
        _ctx: &mut WriteContext,
        _operations: &[TransactionOperation],
    ) -> Result<()> {
        Ok(())
    }

    fn on_transaction_prepare(
        &self,
        _ctx: &mut WriteContext,
        _operations: &[TransactionOperation],
    ) -> Result<()> {
        Ok(())
    }

    /// A prepared transaction applied on a node that is not primary, at the log position of the
    /// prepare entry.
    fn on_transaction_prepare_non_primary(
        &self,
        _ctx: &mut WriteContext,
        _operations: &[TransactionOperation],
        _prepare_op_time: OpTime,
    ) -> Result<()> {
        Ok(())
    }
}

/// The ordered observer chain.
#[derive(Debug, Default)]
pub struct OpObserverRegistry {
    observers: Vec<Arc<dyn OpObserver>>,
}

impl OpObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn OpObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn dispatch<F>(&self, ctx: &mut WriteContext, mut f: F) -> Result<()>
    where
        F: FnMut(&dyn OpObserver, &mut WriteContext) -> Result<()>,
    {
        for observer in &self.observers {
            f(observer.as_ref(), ctx).map_err(|source| WriteError::Observer {
                observer: observer.name(),
                source: Box::new(source),
            })?;
        }
        Ok(())
    }

    pub fn on_insert(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        doc: &Document,
    ) -> Result<()> {
        self.dispatch(ctx, |o, ctx| o.on_insert(ctx, nss, doc))
    }

    pub fn on_update(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        args: &UpdateArgs,
    ) -> Result<()> {
        self.dispatch(ctx, |o, ctx| o.on_update(ctx, nss, args))
    }

    pub fn about_to_delete(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        doc: &Document,
    ) -> Result<()> {
        self.dispatch(ctx, |o, ctx| o.about_to_delete(ctx, nss, doc))
    }

    pub fn on_delete(
        &self,
        ctx: &mut WriteContext,
        nss: &NamespaceString,
        document_key: &DocumentKey,
    ) -> Result<()> {
        self.dispatch(ctx, |o, ctx| o.on_delete(ctx, nss, document_key))
    }

    /// Notify the chain that the transaction of `ctx` commits without a prepare.
    pub fn on_unprepared_transaction_commit(&self, ctx: &mut WriteContext) -> Result<()> {
        let operations = transaction_operations(ctx)?;
        self.dispatch(ctx, |o, ctx| {
            o.on_unprepared_transaction_commit(ctx, &operations)
        })
    }

    pub fn on_transaction_prepare(&self, ctx: &mut WriteContext) -> Result<()> {
        let operations = transaction_operations(ctx)?;
        self.dispatch(ctx, |o, ctx| o.on_transaction_prepare(ctx, &operations))
    }

    pub fn on_transaction_prepare_non_primary(
        &self,
        ctx: &mut WriteContext,
        prepare_op_time: OpTime,
    ) -> Result<()> {
        let operations = transaction_operations(ctx)?;
        self.dispatch(ctx, |o, ctx| {
            o.on_transaction_prepare_non_primary(ctx, &operations, prepare_op_time)
        })
    }
}

fn transaction_operations(ctx: &WriteContext) -> Result<Vec<TransactionOperation>> {
    ctx.transaction()
        .map(|txn| txn.operations().to_vec())
        .ok_or_else(|| WriteError::CommandFailed("no transaction in progress".to_string()))
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use shardkeeper_types::{ErrorCode, ShardKeyPattern};

    use super::*;
    use crate::test_util::doc;

    #[derive(Debug)]
    struct Recording {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl OpObserver for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn on_insert(
            &self,
            _ctx: &mut WriteContext,
            _nss: &NamespaceString,
            _doc: &Document,
        ) -> Result<()> {
            self.calls.lock().push(self.name);
            if self.fail {
                return Err(WriteError::MovePrimaryInProgress(NamespaceString::new(
                    "db", "orders",
                )));
            }
            Ok(())
        }
    }

    #[test]
    fn stops_at_first_failing_observer() {
        let calls = Arc::new(Mutex::new(vec![]));
        let mut registry = OpObserverRegistry::new();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            registry.add_observer(Arc::new(Recording {
                name,
                fail,
                calls: Arc::clone(&calls),
            }));
        }
        assert_eq!(3, registry.len());

        let mut ctx = WriteContext::new();
        let err = registry
            .on_insert(
                &mut ctx,
                &NamespaceString::new("db", "orders"),
                &doc(serde_json::json!({"_id": 1})),
            )
            .unwrap_err();
        assert_eq!(ErrorCode::MovePrimaryInProgress, err.code());
        assert!(matches!(err, WriteError::Observer { observer: "second", .. }));
        assert_eq!(vec!["first", "second"], *calls.lock());

        // default hooks do nothing
        let key = ShardKeyPattern::new(["x"])
            .unwrap()
            .document_key(&doc(serde_json::json!({"_id": 1, "x": 1})));
        registry
            .on_delete(&mut ctx, &NamespaceString::new("db", "orders"), &key)
            .unwrap();
    }

    #[test]
    fn transaction_hooks_require_a_transaction() {
        let registry = OpObserverRegistry::new();
        let err = registry
            .on_unprepared_transaction_commit(&mut WriteContext::new())
            .unwrap_err();
        assert_eq!(ErrorCode::CommandFailed, err.code());
    }
}
