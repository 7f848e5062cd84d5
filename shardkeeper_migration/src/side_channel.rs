//! Per-write state handed from one observer to the next.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::sharding_state::ShardingWriteRouter;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SideChannelKey {
    ShardingWriteRouter,
    AboutToDelete,
}

#[derive(Debug, Clone)]
pub enum SideChannelValue {
    ShardingWriteRouter(Arc<ShardingWriteRouter>),
    /// Taken before a delete: whether the deleted document was in a chunk being migrated.
    AboutToDelete { is_migrating: bool },
}

impl SideChannelValue {
    pub fn key(&self) -> SideChannelKey {
        match self {
            Self::ShardingWriteRouter(_) => SideChannelKey::ShardingWriteRouter,
            Self::AboutToDelete { .. } => SideChannelKey::AboutToDelete,
        }
    }
}

/// Typed side channel of one operation. Each key holds at most one value and each value can only
/// be stored under its own key.
#[derive(Debug, Default)]
pub struct OpStateAccumulator {
    entries: HashMap<SideChannelKey, SideChannelValue>,
}

impl OpStateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the value it replaced.
    pub fn insert(&mut self, value: SideChannelValue) -> Option<SideChannelValue> {
        self.entries.insert(value.key(), value)
    }

    pub fn get(&self, key: SideChannelKey) -> Option<&SideChannelValue> {
        self.entries.get(&key)
    }

    pub fn remove(&mut self, key: SideChannelKey) -> Option<SideChannelValue> {
        self.entries.remove(&key)
    }

    pub fn sharding_write_router(&self) -> Option<&Arc<ShardingWriteRouter>> {
        match self.get(SideChannelKey::ShardingWriteRouter)? {
            SideChannelValue::ShardingWriteRouter(router) => Some(router),
            _ => None,
        }
    }

    /// Consume the decision recorded before the current delete.
    pub fn take_about_to_delete(&mut self) -> Option<bool> {
        match self.remove(SideChannelKey::AboutToDelete)? {
            SideChannelValue::AboutToDelete { is_migrating } => Some(is_migrating),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use shardkeeper_types::{NamespaceString, ShardId};

    use super::*;
    use crate::sharding_state::ShardingStateRegistry;

    #[test]
    fn values_live_under_their_own_key() {
        let mut acc = OpStateAccumulator::new();
        assert!(acc.sharding_write_router().is_none());
        assert_eq!(None, acc.take_about_to_delete());

        assert!(
            acc.insert(SideChannelValue::AboutToDelete { is_migrating: true })
                .is_none()
        );
        assert!(
            acc.insert(SideChannelValue::AboutToDelete {
                is_migrating: false
            })
            .is_some()
        );
        assert_eq!(Some(false), acc.take_about_to_delete());
        // consumed
        assert_eq!(None, acc.take_about_to_delete());

        let registry = ShardingStateRegistry::new(ShardId::new("s0"));
        let router = Arc::new(ShardingWriteRouter::new(
            &registry,
            &NamespaceString::new("db", "orders"),
        ));
        acc.insert(SideChannelValue::ShardingWriteRouter(Arc::clone(&router)));
        assert!(Arc::ptr_eq(&router, acc.sharding_write_router().unwrap()));
        assert!(acc.get(SideChannelKey::AboutToDelete).is_none());
    }
}
