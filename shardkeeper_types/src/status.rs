//! Stable error codes and the serialized error status stored in recovery documents and sent
//! between nodes.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized statuses larger than this are replaced by a truncated one.
pub const MAX_SERIALIZED_STATUS_BYTES: usize = 2048;

macro_rules! error_codes {
    ($($name:ident = $value:literal),+ $(,)?) => {
        /// Error codes shared by every component. The numeric value is what goes over the wire.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($name),+
        }

        impl ErrorCode {
            pub fn as_i32(&self) -> i32 {
                match self {
                    $(Self::$name => $value),+
                }
            }

            pub fn from_i32(code: i32) -> Option<Self> {
                match code {
                    $($value => Some(Self::$name),)+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name)),+
                }
            }
        }
    };
}

error_codes! {
    InternalError = 1,
    InvalidOptions = 72,
    IllegalOperation = 20,
    LockTimeout = 24,
    NamespaceNotFound = 26,
    NamespaceExists = 48,
    CommandFailed = 125,
    ConflictingOperationInProgress = 117,
    NamespaceNotSharded = 118,
    ShardNotFound = 70,
    InvalidNamespace = 73,
    TransactionTooOld = 225,
    IncompleteTransactionHistory = 217,
    InvalidUUID = 242,
    Interrupted = 11601,
    NotWritablePrimary = 10107,
    StaleConfig = 13388,
    StaleDbVersion = 249,
    StaleChunkHistory = 311,
    ShardKeyNotFound = 61,
    MovePrimaryInProgress = 10301,
    ChunkOwnerMoved = 10302,
    TruncatedSerialization = 10303,
}

impl ErrorCode {
    /// Errors a caller may resolve by retrying the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout
                | Self::StaleConfig
                | Self::StaleDbVersion
                | Self::NotWritablePrimary
                | Self::Interrupted
        )
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StatusParseError {
    #[error("malformed error status: {0}")]
    Malformed(String),

    #[error("unknown error code {0}")]
    UnknownCode(i32),
}

/// A non-OK outcome: an error code and a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: ErrorCode,
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct SerializedStatus {
    code: i32,
    #[serde(rename = "codeName")]
    code_name: String,
    errmsg: String,
}

impl Status {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Serialize to `{code, codeName, errmsg}`. A status that would serialize to more than
    /// [`MAX_SERIALIZED_STATUS_BYTES`] is replaced by a `TruncatedSerialization` status carrying
    /// the prefix of the original message.
    pub fn serialize(&self) -> Value {
        let full = self.to_value();
        if full.to_string().len() <= MAX_SERIALIZED_STATUS_BYTES {
            return full;
        }
        Self::new(
            ErrorCode::TruncatedSerialization,
            truncate_utf8(&self.reason, MAX_SERIALIZED_STATUS_BYTES),
        )
        .to_value()
    }

    pub fn deserialize(value: &Value) -> Result<Self, StatusParseError> {
        let s: SerializedStatus = serde_json::from_value(value.clone())
            .map_err(|e| StatusParseError::Malformed(e.to_string()))?;
        let code = ErrorCode::from_i32(s.code).ok_or(StatusParseError::UnknownCode(s.code))?;
        Ok(Self::new(code, s.errmsg))
    }

    fn to_value(&self) -> Value {
        serde_json::json!({
            "code": self.code.as_i32(),
            "codeName": self.code.name(),
            "errmsg": self.reason,
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
