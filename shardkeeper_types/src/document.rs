//! Documents, shard key patterns and shard key values.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::ErrorCode;

/// A document as seen by the write path. Only shard key extraction looks inside it.
pub type Document = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "_id";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ShardKeyError {
    #[error("shard key field '{field}' cannot be an array")]
    ArrayValue { field: String },

    #[error("shard key field '{field}' has unsupported value {value}")]
    UnsupportedValue { field: String, value: String },

    #[error("shard key pattern must have at least one field")]
    EmptyPattern,
}

impl ShardKeyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ArrayValue { .. } | Self::UnsupportedValue { .. } => ErrorCode::ShardKeyNotFound,
            Self::EmptyPattern => ErrorCode::InvalidOptions,
        }
    }
}

/// One component of a shard key value, ordered the same way for every collection: no collation
/// ever applies to shard keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    MinKey,
    Null,
    Int(i64),
    Str(String),
    Bool(bool),
    MaxKey,
}

impl KeyPart {
    fn from_value(field: &str, value: &Value) -> Result<Self, ShardKeyError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::String(s) => Ok(Self::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Int).ok_or_else(|| {
                ShardKeyError::UnsupportedValue {
                    field: field.to_string(),
                    value: n.to_string(),
                }
            }),
            Value::Array(_) => Err(ShardKeyError::ArrayValue {
                field: field.to_string(),
            }),
            Value::Object(_) => Err(ShardKeyError::UnsupportedValue {
                field: field.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MinKey => f.write_str("MinKey"),
            Self::Null => f.write_str("null"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Bool(b) => write!(f, "{b}"),
            Self::MaxKey => f.write_str("MaxKey"),
        }
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// A point in shard key space, compared component by component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKeyValue(Vec<KeyPart>);

impl ShardKeyValue {
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self(parts.into_iter().collect())
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl Display for ShardKeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{ ")?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            p.fmt(f)?;
        }
        f.write_str(" }")
    }
}

/// Identifies a document for a migration destination: the shard key fields plus `_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentKey(Document);

impl DocumentKey {
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get(ID_FIELD)
    }
}

/// Ordered list of (possibly dotted) field paths making up a collection's shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<String>,
}

impl ShardKeyPattern {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, ShardKeyError> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(ShardKeyError::EmptyPattern);
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn global_min(&self) -> ShardKeyValue {
        ShardKeyValue(vec![KeyPart::MinKey; self.fields.len()])
    }

    pub fn global_max(&self) -> ShardKeyValue {
        ShardKeyValue(vec![KeyPart::MaxKey; self.fields.len()])
    }

    /// Extract the shard key value of a full document or of a document key. Missing fields
    /// extract as `null`.
    pub fn extract_shard_key_from_doc(
        &self,
        doc: &Document,
    ) -> Result<ShardKeyValue, ShardKeyError> {
        self.fields
            .iter()
            .map(|field| match get_path(doc, field) {
                Some(v) => KeyPart::from_value(field, v),
                None => Ok(KeyPart::Null),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ShardKeyValue)
    }

    pub fn extract_shard_key_from_document_key(
        &self,
        key: &DocumentKey,
    ) -> Result<ShardKeyValue, ShardKeyError> {
        self.extract_shard_key_from_doc(&key.0)
    }

    /// Build the document key of `doc`, keyed by the dotted field names of the pattern.
    pub fn document_key(&self, doc: &Document) -> DocumentKey {
        let mut key = Document::new();
        for field in &self.fields {
            if let Some(v) = get_path(doc, field) {
                key.insert(field.clone(), v.clone());
            }
        }
        if let Some(id) = doc.get(ID_FIELD) {
            key.insert(ID_FIELD.to_string(), id.clone());
        }
        DocumentKey(key)
    }
}

impl Display for ShardKeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ {}: 1 }}", self.fields.join(": 1, "))
    }
}

/// Look up a dotted path. A literal key containing dots (as stored in a document key) wins over
/// descending into sub-documents.
fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    if let Some(v) = doc.get(path) {
        return Some(v);
    }
    let (head, rest) = path.split_once('.')?;
    match doc.get(head)? {
        Value::Object(sub) => get_path(sub, rest),
        _ => None,
    }
}
