//! Shard-facing command contract and the in-process transport used by tests
//! and single-process clusters.

use crate::clock::Timestamp;
use crate::error::{Result, ShardgateError};
use crate::key::{KeyRange, ShardKey, ShardKeyPattern};
use crate::namespace::{Namespace, ShardId};
use crate::query::Collation;
use crate::registry::HostAndPort;
use crate::shard_node::InMemoryShard;
use crate::version::ChunkVersion;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindCommand {
    pub filter: Value,
    #[serde(default)]
    pub sort: Option<Value>,
    #[serde(default)]
    pub projection: Option<Value>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Shards return at most this many documents in total.
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub collation: Option<Collation>,
    #[serde(default)]
    pub tailable: bool,
    #[serde(default)]
    pub await_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ShardCommand {
    Find(FindCommand),
    GetMore {
        cursor_id: u64,
        batch_size: Option<u32>,
        max_time_ms: Option<u64>,
    },
    KillCursors {
        cursor_ids: Vec<u64>,
    },
    Insert {
        documents: Vec<Value>,
    },
    Count {
        filter: Value,
    },
    SplitVector {
        range: KeyRange,
        key_pattern: ShardKeyPattern,
        max_chunk_size_bytes: u64,
    },
    SplitChunk {
        range: KeyRange,
        split_points: Vec<ShardKey>,
        expected: ChunkVersion,
    },
    /// Donor side: start tracking writes to `range` for a migration to `to`.
    MoveChunk {
        migration_id: Uuid,
        range: KeyRange,
        to: ShardId,
    },
    CloneBatch {
        migration_id: Uuid,
        offset: usize,
        batch_size: usize,
    },
    /// Recipient side: store documents of an incoming range.
    RecvChunk {
        migration_id: Uuid,
        documents: Vec<Value>,
    },
    /// Donor side: block writes to the range and hand over captured changes.
    EnterCriticalSection {
        migration_id: Uuid,
    },
    CommitMigration {
        migration_id: Uuid,
    },
    AbortMigration {
        migration_id: Uuid,
    },
    /// Delete documents in a range this shard does not own.
    DeleteRange {
        range: KeyRange,
    },
    #[serde(rename = "_flushRoutingTableCacheUpdates")]
    FlushRoutingTableCacheUpdates,
    DropCollection,
    RenameCollection {
        to: Namespace,
    },
    ListCollections,
    ListIndexes,
    CreateIndexes {
        indexes: Vec<Value>,
    },
    Hello,
}

impl ShardCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ShardCommand::Find(_) => "find",
            ShardCommand::GetMore { .. } => "getMore",
            ShardCommand::KillCursors { .. } => "killCursors",
            ShardCommand::Insert { .. } => "insert",
            ShardCommand::Count { .. } => "count",
            ShardCommand::SplitVector { .. } => "splitVector",
            ShardCommand::SplitChunk { .. } => "splitChunk",
            ShardCommand::MoveChunk { .. } => "moveChunk",
            ShardCommand::CloneBatch { .. } => "cloneBatch",
            ShardCommand::RecvChunk { .. } => "recvChunk",
            ShardCommand::EnterCriticalSection { .. } => "enterCriticalSection",
            ShardCommand::CommitMigration { .. } => "commitMigration",
            ShardCommand::AbortMigration { .. } => "abortMigration",
            ShardCommand::DeleteRange { .. } => "deleteRange",
            ShardCommand::FlushRoutingTableCacheUpdates => "_flushRoutingTableCacheUpdates",
            ShardCommand::DropCollection => "dropCollection",
            ShardCommand::RenameCollection { .. } => "renameCollection",
            ShardCommand::ListCollections => "listCollections",
            ShardCommand::ListIndexes => "listIndexes",
            ShardCommand::CreateIndexes { .. } => "createIndexes",
            ShardCommand::Hello => "hello",
        }
    }

    /// Whether resending after an ambiguous network failure is harmless.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            ShardCommand::Insert { .. } | ShardCommand::GetMore { .. } | ShardCommand::RenameCollection { .. }
        )
    }
}

/// One command addressed to one shard. `shard_version` is what the sender
/// believes the shard's version to be; `None` skips the check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRequest {
    pub ns: Namespace,
    #[serde(default)]
    pub shard_version: Option<ChunkVersion>,
    pub command: ShardCommand,
}

impl ShardRequest {
    pub fn new(ns: Namespace, command: ShardCommand) -> Self {
        Self {
            ns,
            shard_version: None,
            command,
        }
    }

    pub fn versioned(ns: Namespace, version: ChunkVersion, command: ShardCommand) -> Self {
        Self {
            ns,
            shard_version: Some(version),
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorBatch {
    /// Zero once the remote stream is exhausted.
    pub cursor_id: u64,
    pub ns: Namespace,
    pub batch: Vec<Value>,
    /// Tailable cursors only: every document at or below this time has been
    /// returned already.
    #[serde(default)]
    pub post_batch_resume_token: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ShardResponse {
    Ok,
    Cursor(CursorBatch),
    Inserted { n: u64 },
    Count { n: u64 },
    Deleted { n: u64 },
    SplitPoints(Vec<ShardKey>),
    Documents { docs: Vec<Value>, done: bool },
    Items(Vec<Value>),
    Hello { shard: ShardId, is_primary: bool },
}

impl ShardResponse {
    pub fn into_cursor(self) -> Result<CursorBatch> {
        match self {
            ShardResponse::Cursor(c) => Ok(c),
            other => Err(ShardgateError::Internal(format!(
                "expected a cursor reply, got {other:?}"
            ))),
        }
    }
}

#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn send(&self, host: &HostAndPort, request: ShardRequest) -> Result<ShardResponse>;
}

/// Failure injected by `LocalTransport` for matching requests.
#[derive(Debug, Clone)]
pub struct Fault {
    pub host: Option<HostAndPort>,
    pub command: Option<&'static str>,
    pub error: ShardgateError,
    pub times: usize,
}

/// Routes requests straight to in-process shard nodes.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<HostAndPort, Arc<InMemoryShard>>>,
    faults: Mutex<Vec<Fault>>,
    delays: RwLock<HashMap<HostAndPort, Duration>>,
    counters: Mutex<HashMap<(HostAndPort, &'static str), u64>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: HostAndPort, node: Arc<InMemoryShard>) {
        self.nodes.write().insert(host, node);
    }

    /// Make a host unreachable until registered again.
    pub fn unregister(&self, host: &HostAndPort) -> Option<Arc<InMemoryShard>> {
        self.nodes.write().remove(host)
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn set_delay(&self, host: HostAndPort, delay: Duration) {
        self.delays.write().insert(host, delay);
    }

    /// Requests of `command` sent to any host.
    pub fn count(&self, command: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|((_, c), _)| *c == command)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn count_for(&self, host: &HostAndPort, command: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|((h, c), _)| h == host && *c == command)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn reset_counters(&self) {
        self.counters.lock().clear();
    }

    fn take_fault(&self, host: &HostAndPort, command: &'static str) -> Option<ShardgateError> {
        let mut faults = self.faults.lock();
        let idx = faults.iter().position(|f| {
            f.times > 0
                && f.host.as_ref().map(|h| h == host).unwrap_or(true)
                && f.command.map(|c| c == command).unwrap_or(true)
        })?;
        let fault = &mut faults[idx];
        fault.times -= 1;
        let error = fault.error.clone();
        if fault.times == 0 {
            faults.remove(idx);
        }
        Some(error)
    }
}

#[async_trait]
impl ShardTransport for LocalTransport {
    async fn send(&self, host: &HostAndPort, request: ShardRequest) -> Result<ShardResponse> {
        let command = request.command.name();
        *self
            .counters
            .lock()
            .entry((host.clone(), command))
            .or_insert(0) += 1;

        let delay = self.delays.read().get(host).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.take_fault(host, command) {
            return Err(err);
        }
        let node = self.nodes.read().get(host).cloned();
        match node {
            Some(node) => node.handle(request).await,
            None => Err(ShardgateError::HostUnreachable(host.to_string())),
        }
    }
}
