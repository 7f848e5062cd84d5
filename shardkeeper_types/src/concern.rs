use serde::{Deserialize, Serialize};

/// Durability a write waits for before it is acknowledged.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteConcern {
    /// Acknowledged once applied on this node.
    #[default]
    Local,
    /// Acknowledged once replicated to a majority, i.e. it survives a failover.
    Majority,
}

impl WriteConcern {
    pub fn is_majority(&self) -> bool {
        matches!(self, Self::Majority)
    }
}

/// Visibility guarantee of a read.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadConcern {
    /// Whatever this node has applied, including writes that may still be rolled back.
    #[default]
    Local,
    /// Only data acknowledged by a majority.
    Majority,
}
