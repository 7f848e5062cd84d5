//! Work deferred until the storage transaction of a write commits or rolls back.

use std::fmt::Debug;

use observability_deps::tracing::warn;
use shardkeeper_types::OpTime;

/// A deferred action. Exactly one of the two methods is called.
pub trait Change: Debug + Send {
    fn commit(self: Box<Self>, commit_op_time: Option<OpTime>);

    fn rollback(self: Box<Self>);
}

#[derive(Debug, Default)]
pub struct RecoveryUnit {
    changes: Vec<Box<dyn Change>>,
}

impl RecoveryUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_change(&mut self, change: Box<dyn Change>) {
        self.changes.push(change);
    }

    pub fn pending(&self) -> usize {
        self.changes.len()
    }

    /// Run every change's commit handler in registration order.
    pub fn commit(&mut self, commit_op_time: Option<OpTime>) {
        for change in self.changes.drain(..) {
            change.commit(commit_op_time);
        }
    }

    /// Run every change's rollback handler, newest first.
    pub fn rollback(&mut self) {
        for change in self.changes.drain(..).rev() {
            change.rollback();
        }
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        if !self.changes.is_empty() {
            warn!(
                pending = self.changes.len(),
                "dropping recovery unit that was never committed, rolling back"
            );
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use shardkeeper_types::Timestamp;

    use super::*;

    #[derive(Debug)]
    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Change for Record {
        fn commit(self: Box<Self>, commit_op_time: Option<OpTime>) {
            self.log.lock().push(format!(
                "commit {} at {:?}",
                self.name,
                commit_op_time.map(|t| t.term())
            ));
        }

        fn rollback(self: Box<Self>) {
            self.log.lock().push(format!("rollback {}", self.name));
        }
    }

    fn unit(log: &Arc<Mutex<Vec<String>>>) -> RecoveryUnit {
        let mut ru = RecoveryUnit::new();
        for name in ["a", "b"] {
            ru.register_change(Box::new(Record {
                name,
                log: Arc::clone(log),
            }));
        }
        ru
    }

    #[test]
    fn commit_in_order_rollback_in_reverse() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut ru = unit(&log);
        assert_eq!(2, ru.pending());
        ru.commit(Some(OpTime::new(3, Timestamp::new(1, 0))));
        assert_eq!(0, ru.pending());

        unit(&log).rollback();
        assert_eq!(
            vec![
                "commit a at Some(3)",
                "commit b at Some(3)",
                "rollback b",
                "rollback a"
            ],
            *log.lock()
        );
    }
}
