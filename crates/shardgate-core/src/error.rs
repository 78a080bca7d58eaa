use crate::namespace::{Namespace, ShardId};
use crate::version::ChunkVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the router can surface, whether produced locally, by a shard or
/// by the catalog. Cloneable so one failed load can wake many waiters.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ShardgateError {
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("stale shard version for {ns} on shard {shard}: received {received}, wanted {}", display_opt(.wanted))]
    StaleShardVersion {
        ns: Namespace,
        shard: ShardId,
        received: ChunkVersion,
        wanted: Option<ChunkVersion>,
    },
    #[error("stale epoch for {ns}: received {received}, wanted {}", display_opt(.wanted))]
    StaleEpoch {
        ns: Namespace,
        received: ChunkVersion,
        wanted: Option<ChunkVersion>,
    },
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("not master: {0}")]
    NotMaster(String),
    #[error("operation interrupted")]
    Interrupted,
    #[error("operation exceeded time limit")]
    ExceededTimeLimit,
    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),
    #[error("chunk too big: {0}")]
    ChunkTooBig(String),
    #[error("no matching document: {0}")]
    NoMatchingDocument(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("callback canceled")]
    CallbackCanceled,
    #[error("query plan killed: {0}")]
    QueryPlanKilled(String),
    #[error("cursor {0} not found")]
    CursorNotFound(u64),
    #[error("cursor was killed")]
    CursorKilled,
    #[error("key out of range: {0}")]
    KeyOutOfRange(String),
    #[error("shard not found: {0}")]
    ShardNotFound(String),
    #[error("bad value: {0}")]
    BadValue(String),
    #[error("inconsistent chunk map: {0}")]
    InconsistentChunkMap(String),
    #[error("illegal operation: {0}")]
    IllegalOperation(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn display_opt(version: &Option<ChunkVersion>) -> String {
    version
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Stable numeric codes, used on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NamespaceNotFound = 26,
    StaleShardVersion = 63,
    StaleEpoch = 150,
    HostUnreachable = 6,
    NetworkTimeout = 89,
    NotMaster = 10107,
    Interrupted = 11601,
    ExceededTimeLimit = 50,
    ConflictingOperationInProgress = 117,
    ChunkTooBig = 13,
    NoMatchingDocument = 47,
    Unauthorized = 31,
    CommandFailed = 125,
    CallbackCanceled = 90,
    QueryPlanKilled = 175,
    CursorNotFound = 43,
    CursorKilled = 237,
    KeyOutOfRange = 180,
    ShardNotFound = 70,
    BadValue = 2,
    InconsistentChunkMap = 149,
    IllegalOperation = 20,
    Internal = 1,
}

/// Retry taxonomy: which layer may absorb an error and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RetriableNetwork,
    StaleRouting,
    FatalLogical,
    Partial,
    Cancellation,
}

impl ShardgateError {
    pub fn code(&self) -> ErrorCode {
        use ShardgateError::*;
        match self {
            NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            StaleShardVersion { .. } => ErrorCode::StaleShardVersion,
            StaleEpoch { .. } => ErrorCode::StaleEpoch,
            HostUnreachable(_) => ErrorCode::HostUnreachable,
            NetworkTimeout(_) => ErrorCode::NetworkTimeout,
            NotMaster(_) => ErrorCode::NotMaster,
            Interrupted => ErrorCode::Interrupted,
            ExceededTimeLimit => ErrorCode::ExceededTimeLimit,
            ConflictingOperationInProgress(_) => ErrorCode::ConflictingOperationInProgress,
            ChunkTooBig(_) => ErrorCode::ChunkTooBig,
            NoMatchingDocument(_) => ErrorCode::NoMatchingDocument,
            Unauthorized(_) => ErrorCode::Unauthorized,
            CommandFailed(_) => ErrorCode::CommandFailed,
            CallbackCanceled => ErrorCode::CallbackCanceled,
            QueryPlanKilled(_) => ErrorCode::QueryPlanKilled,
            CursorNotFound(_) => ErrorCode::CursorNotFound,
            CursorKilled => ErrorCode::CursorKilled,
            KeyOutOfRange(_) => ErrorCode::KeyOutOfRange,
            ShardNotFound(_) => ErrorCode::ShardNotFound,
            BadValue(_) => ErrorCode::BadValue,
            InconsistentChunkMap(_) => ErrorCode::InconsistentChunkMap,
            IllegalOperation(_) => ErrorCode::IllegalOperation,
            Io(_) | Serialization(_) | Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        use ShardgateError::*;
        match self {
            HostUnreachable(_) | NetworkTimeout(_) | NotMaster(_) => ErrorCategory::RetriableNetwork,
            StaleShardVersion { .. } | StaleEpoch { .. } => ErrorCategory::StaleRouting,
            Interrupted | ExceededTimeLimit | CallbackCanceled => ErrorCategory::Cancellation,
            _ => ErrorCategory::FatalLogical,
        }
    }

    pub fn is_retriable_network(&self) -> bool {
        self.category() == ErrorCategory::RetriableNetwork
    }

    pub fn is_stale_routing(&self) -> bool {
        self.category() == ErrorCategory::StaleRouting
    }

    pub fn is_not_master(&self) -> bool {
        matches!(self, ShardgateError::NotMaster(_))
    }

    /// Namespace and version the shard reported, for cache invalidation.
    pub fn stale_info(&self) -> Option<(&Namespace, Option<&ChunkVersion>)> {
        match self {
            ShardgateError::StaleShardVersion { ns, wanted, .. }
            | ShardgateError::StaleEpoch { ns, wanted, .. } => Some((ns, wanted.as_ref())),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ShardgateError {
    fn from(value: std::io::Error) -> Self {
        ShardgateError::Io(value.to_string())
    }
}

impl From<bincode::Error> for ShardgateError {
    fn from(value: bincode::Error) -> Self {
        ShardgateError::Serialization(value.to_string())
    }
}

impl From<serde_json::Error> for ShardgateError {
    fn from(value: serde_json::Error) -> Self {
        ShardgateError::Serialization(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShardgateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ChunkVersion;

    #[test]
    fn categorizes_errors_for_retry_policy() {
        let stale = ShardgateError::StaleShardVersion {
            ns: Namespace::new("db", "coll"),
            shard: ShardId::new("a"),
            received: ChunkVersion::UNSHARDED,
            wanted: None,
        };
        assert!(stale.is_stale_routing());
        assert!(ShardgateError::NotMaster("h:1".into()).is_retriable_network());
        assert!(ShardgateError::NotMaster("h:1".into()).is_not_master());
        assert_eq!(
            ShardgateError::Interrupted.category(),
            ErrorCategory::Cancellation
        );
        assert_eq!(
            ShardgateError::BadValue("x".into()).category(),
            ErrorCategory::FatalLogical
        );
        assert_eq!(stale.code(), ErrorCode::StaleShardVersion);
    }

    #[test]
    fn errors_survive_json_round_trip() {
        let err = ShardgateError::StaleEpoch {
            ns: Namespace::new("db", "c"),
            received: ChunkVersion::UNSHARDED,
            wanted: Some(ChunkVersion::DROPPED),
        };
        let text = serde_json::to_string(&err).unwrap();
        let back: ShardgateError = serde_json::from_str(&text).unwrap();
        assert_eq!(back, err);
    }
}
