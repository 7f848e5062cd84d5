//! Placement versions attached to requests and catalog entries.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::Timestamp;

/// Identity of one incarnation of a collection's routing table. Changes when the collection is
/// dropped and recreated or resharded; stays the same across chunk migrations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionGeneration {
    pub epoch: Uuid,
    pub timestamp: Timestamp,
}

impl CollectionGeneration {
    pub fn new(epoch: Uuid, timestamp: Timestamp) -> Self {
        Self { epoch, timestamp }
    }
}

/// Version of a chunk (and, by taking the maximum over all chunks, of a collection).
///
/// The major component changes whenever ownership of some chunk moves between shards, the minor
/// component changes on metadata-only changes such as splits or the allow-migrations flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub generation: CollectionGeneration,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub fn new(generation: CollectionGeneration, major: u32, minor: u32) -> Self {
        Self {
            generation,
            major,
            minor,
        }
    }

    pub fn is_same_collection(&self, other: &Self) -> bool {
        self.generation == other.generation
    }

    /// A request stamped with `other` may be served by metadata at `self`: same routing table
    /// generation and no ownership change in between.
    pub fn is_write_compatible_with(&self, other: &Self) -> bool {
        self.is_same_collection(other) && self.major == other.major
    }

    /// Orders versions of the same generation.
    pub fn is_older_than(&self, other: &Self) -> bool {
        (self.major, self.minor) < (other.major, other.minor)
    }

    pub fn inc_major(&self) -> Self {
        Self::new(self.generation, self.major + 1, 0)
    }

    pub fn inc_minor(&self) -> Self {
        Self::new(self.generation, self.major, self.minor + 1)
    }
}

impl Display for ChunkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}||{}||{}",
            self.major, self.minor, self.generation.epoch, self.generation.timestamp
        )
    }
}

/// The placement version a request was routed with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardVersion {
    /// The router believes the collection is not sharded.
    Unsharded,
    Sharded(ChunkVersion),
}

impl Display for ShardVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsharded => f.write_str("UNSHARDED"),
            Self::Sharded(v) => v.fmt(f),
        }
    }
}

/// Version of a database's primary-shard assignment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub uuid: Uuid,
    pub timestamp: Timestamp,
    pub last_mod: u32,
}

impl DatabaseVersion {
    pub fn new(uuid: Uuid, timestamp: Timestamp) -> Self {
        Self {
            uuid,
            timestamp,
            last_mod: 1,
        }
    }

    pub fn make_updated(&self) -> Self {
        Self {
            last_mod: self.last_mod + 1,
            ..*self
        }
    }
}

impl Display for DatabaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.uuid, self.timestamp, self.last_mod)
    }
}
