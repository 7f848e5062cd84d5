use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

/// Longest namespace that may be used by a sharded collection.
pub const MAX_NS_SHARDED_COLLECTION_LEN: usize = 235;

const SYSTEM_COLLECTION_PREFIX: &str = "system.";
const TIMESERIES_BUCKETS_PREFIX: &str = "system.buckets.";
const SYSTEM_VIEWS_COLLECTION: &str = "system.views";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("namespace '{0}' is missing a '.' separating database and collection")]
    MissingSeparator(String),

    #[error("namespace '{0}' has an empty database name")]
    EmptyDatabase(String),

    #[error("namespace '{0}' has an empty collection name")]
    EmptyCollection(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseName(Arc<str>);

impl DatabaseName {
    pub const ADMIN: &'static str = "admin";
    pub const CONFIG: &'static str = "config";
    pub const LOCAL: &'static str = "local";

    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Internal databases hold cluster bookkeeping and are never user data.
    pub fn is_internal(&self) -> bool {
        matches!(self.as_str(), Self::ADMIN | Self::CONFIG | Self::LOCAL)
    }
}

impl Display for DatabaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A fully qualified `<database>.<collection>` name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespaceString {
    db: DatabaseName,
    coll: Arc<str>,
}

impl NamespaceString {
    pub fn new(db: impl Into<DatabaseName>, coll: impl Into<Arc<str>>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a dotted namespace. Only the first `.` separates the database from the collection.
    pub fn parse(ns: &str) -> Result<Self, NamespaceError> {
        let Some((db, coll)) = ns.split_once('.') else {
            return Err(NamespaceError::MissingSeparator(ns.to_string()));
        };
        if db.is_empty() {
            return Err(NamespaceError::EmptyDatabase(ns.to_string()));
        }
        if coll.is_empty() {
            return Err(NamespaceError::EmptyCollection(ns.to_string()));
        }
        Ok(Self::new(db, coll))
    }

    /// The table backing retryable writes and transactions, `config.transactions`.
    pub fn session_transactions_table() -> Self {
        Self::new(DatabaseName::CONFIG, "transactions")
    }

    pub fn db_name(&self) -> &DatabaseName {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Length of the dotted representation.
    pub fn size(&self) -> usize {
        self.db.as_str().len() + 1 + self.coll.len()
    }

    pub fn is_system(&self) -> bool {
        self.coll.starts_with(SYSTEM_COLLECTION_PREFIX)
    }

    /// A user collection: not a `system.*` collection and not in an internal database.
    pub fn is_normal_collection(&self) -> bool {
        !self.is_system() && !self.db.is_internal()
    }

    pub fn is_system_views(&self) -> bool {
        self.coll.as_ref() == SYSTEM_VIEWS_COLLECTION
    }

    pub fn is_timeseries_buckets_collection(&self) -> bool {
        self.coll.starts_with(TIMESERIES_BUCKETS_PREFIX)
    }

    pub fn is_session_transactions_table(&self) -> bool {
        self.db.as_str() == DatabaseName::CONFIG && self.coll.as_ref() == "transactions"
    }
}

impl Display for NamespaceString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
