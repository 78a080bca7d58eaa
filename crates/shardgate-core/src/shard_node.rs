//! Reference shard node. Stores documents in memory and implements the
//! shard side of every command the router and coordinator send: version
//! checks against filtering metadata, orphan filtering, sort keys, tailable
//! cursors with high-water marks and the donor/recipient halves of a
//! migration.

use crate::catalog::CatalogClient;
use crate::chunk_map::ChunkMap;
use crate::clock::{ClusterClock, Timestamp};
use crate::config::ClusterParams;
use crate::error::{Result, ShardgateError};
use crate::key::{KeyRange, ShardKey, ShardKeyPattern};
use crate::namespace::{Namespace, ShardId};
use crate::query::{apply_projection, matches_filter, SortPattern, SORT_KEY_FIELD};
use crate::transport::{CursorBatch, FindCommand, ShardCommand, ShardRequest, ShardResponse};
use crate::version::ChunkVersion;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredDoc {
    ts: Timestamp,
    doc: Value,
}

#[derive(Debug)]
struct StoredCollection {
    /// Replaced whenever the collection is dropped, so cursors notice.
    incarnation: Uuid,
    docs: Vec<StoredDoc>,
    indexes: Vec<Value>,
}

impl StoredCollection {
    fn new() -> Self {
        Self {
            incarnation: Uuid::new_v4(),
            docs: Vec::new(),
            indexes: Vec::new(),
        }
    }
}

/// What this node believes about a collection's placement.
#[derive(Debug, Clone)]
enum Filtering {
    Unsharded,
    Sharded(Arc<ChunkMap>),
}

impl Filtering {
    fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        match self {
            Filtering::Unsharded => ChunkVersion::UNSHARDED,
            Filtering::Sharded(map) => map.shard_version(shard),
        }
    }

    fn map(&self) -> Option<&Arc<ChunkMap>> {
        match self {
            Filtering::Sharded(map) => Some(map),
            Filtering::Unsharded => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SortMode {
    None,
    ClusterTime,
}

#[derive(Debug)]
struct TailState {
    filter: Value,
    projection: Option<Value>,
    sorted: bool,
    owned: Option<Arc<ChunkMap>>,
    scanned_to: Timestamp,
}

#[derive(Debug)]
struct ShardCursor {
    ns: Namespace,
    incarnation: Uuid,
    version: Option<ChunkVersion>,
    batch_size: Option<u32>,
    pending: VecDeque<(Timestamp, Value)>,
    tail: Option<TailState>,
}

struct MigrationSource {
    ns: Namespace,
    range: KeyRange,
    key_pattern: ShardKeyPattern,
    to: ShardId,
    mods: Vec<Value>,
    critical: watch::Sender<bool>,
}

#[derive(Default)]
struct NodeState {
    collections: HashMap<Namespace, StoredCollection>,
    filtering: HashMap<Namespace, Filtering>,
    cursors: HashMap<u64, ShardCursor>,
    migrations: HashMap<Uuid, MigrationSource>,
}

pub struct InMemoryShard {
    id: ShardId,
    catalog: Arc<dyn CatalogClient>,
    clock: Arc<ClusterClock>,
    params: ClusterParams,
    primary: AtomicBool,
    next_cursor_id: AtomicU64,
    state: RwLock<NodeState>,
    inserted: Notify,
}

impl InMemoryShard {
    pub fn new(
        id: ShardId,
        catalog: Arc<dyn CatalogClient>,
        clock: Arc<ClusterClock>,
        params: ClusterParams,
    ) -> Self {
        Self {
            id,
            catalog,
            clock,
            params,
            primary: AtomicBool::new(true),
            next_cursor_id: AtomicU64::new(1),
            state: RwLock::new(NodeState::default()),
            inserted: Notify::new(),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// Demote or promote this node. A demoted node answers `NotMaster`.
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Every stored document of `ns`, orphans included, in insertion order.
    pub fn documents(&self, ns: &Namespace) -> Vec<Value> {
        self.state
            .read()
            .collections
            .get(ns)
            .map(|c| c.docs.iter().map(|d| d.doc.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.read().cursors.len()
    }

    pub async fn handle(&self, request: ShardRequest) -> Result<ShardResponse> {
        if !self.is_primary() && !matches!(request.command, ShardCommand::Hello) {
            return Err(ShardgateError::NotMaster(self.id.to_string()));
        }
        let ShardRequest {
            ns,
            shard_version,
            command,
        } = request;
        match command {
            ShardCommand::Find(find) => self.find(ns, shard_version, find).await,
            ShardCommand::GetMore {
                cursor_id,
                batch_size,
                max_time_ms,
            } => self.get_more(cursor_id, batch_size, max_time_ms).await,
            ShardCommand::KillCursors { cursor_ids } => {
                let mut state = self.state.write();
                for id in cursor_ids {
                    state.cursors.remove(&id);
                }
                Ok(ShardResponse::Ok)
            }
            ShardCommand::Insert { documents } => self.insert(ns, shard_version, documents).await,
            ShardCommand::Count { filter } => self.count(ns, shard_version, filter).await,
            ShardCommand::SplitVector {
                range,
                key_pattern,
                max_chunk_size_bytes,
            } => Ok(ShardResponse::SplitPoints(self.split_vector(
                &ns,
                &range,
                &key_pattern,
                max_chunk_size_bytes,
            )?)),
            ShardCommand::SplitChunk {
                range,
                split_points,
                expected,
            } => self.check_split(ns, range, split_points, expected).await,
            ShardCommand::MoveChunk {
                migration_id,
                range,
                to,
            } => self.start_migration(ns, migration_id, range, to).await,
            ShardCommand::CloneBatch {
                migration_id,
                offset,
                batch_size,
            } => self.clone_batch(migration_id, offset, batch_size),
            ShardCommand::RecvChunk { documents, .. } => Ok(ShardResponse::Inserted {
                n: self.receive(&ns, documents),
            }),
            ShardCommand::EnterCriticalSection { migration_id } => self.enter_critical_section(migration_id),
            ShardCommand::CommitMigration { migration_id } => {
                self.finish_migration(migration_id, true);
                Ok(ShardResponse::Ok)
            }
            ShardCommand::AbortMigration { migration_id } => {
                self.finish_migration(migration_id, false);
                Ok(ShardResponse::Ok)
            }
            ShardCommand::DeleteRange { range } => self.delete_range(ns, range).await,
            ShardCommand::FlushRoutingTableCacheUpdates => {
                self.refresh(&ns).await?;
                Ok(ShardResponse::Ok)
            }
            ShardCommand::DropCollection => {
                let mut state = self.state.write();
                state.collections.remove(&ns);
                state.filtering.remove(&ns);
                info!(shard = %self.id, %ns, "collection dropped");
                Ok(ShardResponse::Ok)
            }
            ShardCommand::RenameCollection { to } => {
                let mut state = self.state.write();
                if let Some(mut coll) = state.collections.remove(&ns) {
                    coll.incarnation = Uuid::new_v4();
                    state.collections.insert(to.clone(), coll);
                }
                state.filtering.remove(&ns);
                state.filtering.remove(&to);
                Ok(ShardResponse::Ok)
            }
            ShardCommand::ListCollections => {
                let state = self.state.read();
                let mut names: Vec<&str> = state
                    .collections
                    .keys()
                    .filter(|n| n.db == ns.db)
                    .map(|n| n.coll.as_str())
                    .collect();
                names.sort_unstable();
                Ok(ShardResponse::Items(
                    names.into_iter().map(|n| json!({ "name": n })).collect(),
                ))
            }
            ShardCommand::ListIndexes => {
                let state = self.state.read();
                let mut items = vec![json!({"name": "_id_", "key": {"_id": 1}})];
                if let Some(coll) = state.collections.get(&ns) {
                    items.extend(coll.indexes.iter().cloned());
                }
                Ok(ShardResponse::Items(items))
            }
            ShardCommand::CreateIndexes { indexes } => {
                let mut state = self.state.write();
                let coll = state
                    .collections
                    .entry(ns)
                    .or_insert_with(StoredCollection::new);
                for index in indexes {
                    if !coll.indexes.contains(&index) {
                        coll.indexes.push(index);
                    }
                }
                Ok(ShardResponse::Ok)
            }
            ShardCommand::Hello => Ok(ShardResponse::Hello {
                shard: self.id.clone(),
                is_primary: self.is_primary(),
            }),
        }
    }

    /// Reload filtering metadata for `ns` from the catalog. A concurrent
    /// refresh that already installed a newer map of the same epoch wins.
    async fn refresh(&self, ns: &Namespace) -> Result<Filtering> {
        let fresh = match self.catalog.get_collection(ns).await? {
            Some(entry) if !entry.dropped => {
                let chunks = self.catalog.get_chunks(ns, None).await?;
                Filtering::Sharded(Arc::new(ChunkMap::build(entry.metadata(), chunks)?))
            }
            _ => Filtering::Unsharded,
        };
        let mut state = self.state.write();
        if let (Some(Filtering::Sharded(current)), Filtering::Sharded(new)) = (state.filtering.get(ns), &fresh) {
            if new.collection_version().is_older_than(&current.collection_version()) {
                return Ok(Filtering::Sharded(current.clone()));
            }
        }
        debug!(shard = %self.id, %ns, version = %fresh.shard_version(&self.id), "filtering metadata refreshed");
        state.filtering.insert(ns.clone(), fresh.clone());
        Ok(fresh)
    }

    async fn filtering(&self, ns: &Namespace) -> Result<Filtering> {
        let known = self.state.read().filtering.get(ns).cloned();
        match known {
            Some(f) => Ok(f),
            None => self.refresh(ns).await,
        }
    }

    fn compare_version(&self, ns: &Namespace, local: &Filtering, received: ChunkVersion) -> Result<()> {
        let wanted = local.shard_version(&self.id);
        if received.is_unsharded() {
            return match local {
                Filtering::Unsharded => Ok(()),
                Filtering::Sharded(_) => Err(ShardgateError::StaleShardVersion {
                    ns: ns.clone(),
                    shard: self.id.clone(),
                    received,
                    wanted: Some(wanted),
                }),
            };
        }
        if !received.same_epoch(&wanted) {
            return Err(ShardgateError::StaleEpoch {
                ns: ns.clone(),
                received,
                wanted: Some(wanted),
            });
        }
        if !received.is_write_compatible_with(&wanted) {
            return Err(ShardgateError::StaleShardVersion {
                ns: ns.clone(),
                shard: self.id.clone(),
                received,
                wanted: Some(wanted),
            });
        }
        Ok(())
    }

    /// Filtering metadata to serve a request with, after checking the
    /// version the sender attached. Refreshes once when the sender may know
    /// more than this node.
    async fn checked_filtering(&self, ns: &Namespace, received: Option<ChunkVersion>) -> Result<Option<Filtering>> {
        let Some(received) = received else {
            return Ok(None);
        };
        let local = self.filtering(ns).await?;
        if self.compare_version(ns, &local, received).is_ok() {
            return Ok(Some(local));
        }
        let local_version = local.shard_version(&self.id);
        if !received.same_epoch(&local_version) || local_version.is_older_than(&received) {
            let fresh = self.refresh(ns).await?;
            self.compare_version(ns, &fresh, received)?;
            return Ok(Some(fresh));
        }
        self.compare_version(ns, &local, received)?;
        Ok(Some(local))
    }

    fn owns(&self, owned: Option<&Arc<ChunkMap>>, doc: &Value) -> bool {
        match owned {
            None => true,
            Some(map) => map
                .find_chunk_for_document(doc)
                .map(|c| c.shard == self.id)
                .unwrap_or(false),
        }
    }

    fn next_cursor_id(&self) -> u64 {
        self.next_cursor_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn find(&self, ns: Namespace, version: Option<ChunkVersion>, cmd: FindCommand) -> Result<ShardResponse> {
        let filtering = self.checked_filtering(&ns, version).await?;
        let owned = filtering.as_ref().and_then(|f| f.map()).cloned();
        let filter = if cmd.filter.is_null() { json!({}) } else { cmd.filter.clone() };

        let cluster_time_sort = cmd
            .sort
            .as_ref()
            .map(|s| s == &json!({"$clusterTime": 1}))
            .unwrap_or(false);
        let field_sort = match &cmd.sort {
            Some(s) if !cluster_time_sort => {
                if cmd.tailable {
                    return Err(ShardgateError::BadValue(
                        "tailable cursors can only be sorted by $clusterTime".to_string(),
                    ));
                }
                Some(SortPattern::from_json(s)?)
            }
            _ => None,
        };
        let mode = if cluster_time_sort { SortMode::ClusterTime } else { SortMode::None };

        let (mut rows, incarnation, hwm) = {
            let mut state = self.state.write();
            let coll = state
                .collections
                .entry(ns.clone())
                .or_insert_with(StoredCollection::new);
            let mut rows = Vec::new();
            for stored in &coll.docs {
                if !matches_filter(&stored.doc, &filter)? || !self.owns(owned.as_ref(), &stored.doc) {
                    continue;
                }
                rows.push((stored.ts, stored.doc.clone()));
            }
            (rows, coll.incarnation, self.clock.peek())
        };

        if let Some(pattern) = &field_sort {
            for (_, doc) in rows.iter_mut() {
                let key = pattern.sort_key(doc);
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert(SORT_KEY_FIELD.to_string(), key);
                }
            }
            rows.sort_by(|a, b| pattern.compare_sort_keys(&a.1[SORT_KEY_FIELD], &b.1[SORT_KEY_FIELD]));
        }
        if mode == SortMode::ClusterTime {
            for (ts, doc) in rows.iter_mut() {
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert(SORT_KEY_FIELD.to_string(), json!([ts.as_u64()]));
                }
            }
        }
        if let (Some(limit), false) = (cmd.limit, cmd.tailable) {
            rows.truncate(limit as usize);
        }
        if let Some(projection) = &cmd.projection {
            for (_, doc) in rows.iter_mut() {
                *doc = apply_projection(doc, projection)?;
            }
        }

        let tail = cmd.tailable.then(|| TailState {
            filter,
            projection: cmd.projection.clone(),
            sorted: mode == SortMode::ClusterTime,
            owned,
            scanned_to: hwm,
        });
        let cursor = ShardCursor {
            ns: ns.clone(),
            incarnation,
            version,
            batch_size: cmd.batch_size,
            pending: rows.into_iter().collect(),
            tail,
        };
        Ok(ShardResponse::Cursor(self.next_batch(cursor, cmd.batch_size, None)))
    }

    /// Cut one batch from `cursor`, registering it again if it stays open.
    fn next_batch(&self, mut cursor: ShardCursor, batch_size: Option<u32>, id: Option<u64>) -> CursorBatch {
        let size = batch_size
            .or(cursor.batch_size)
            .unwrap_or(self.params.default_batch_size)
            .max(1) as usize;
        let mut batch = Vec::with_capacity(size.min(cursor.pending.len()));
        let mut last_ts = None;
        while batch.len() < size {
            let Some((ts, doc)) = cursor.pending.pop_front() else {
                break;
            };
            last_ts = Some(ts);
            batch.push(doc);
        }
        let token = cursor.tail.as_ref().map(|t| {
            if cursor.pending.is_empty() {
                t.scanned_to
            } else {
                last_ts.unwrap_or(t.scanned_to)
            }
        });
        let ns = cursor.ns.clone();
        let open = cursor.tail.is_some() || !cursor.pending.is_empty();
        let cursor_id = if open {
            let id = id.unwrap_or_else(|| self.next_cursor_id());
            self.state.write().cursors.insert(id, cursor);
            id
        } else {
            0
        };
        CursorBatch {
            cursor_id,
            ns,
            batch,
            post_batch_resume_token: token,
        }
    }

    /// Append documents newer than the cursor's scan position.
    fn scan_tail(&self, cursor: &mut ShardCursor) -> Result<()> {
        let Some(tail) = cursor.tail.as_mut() else {
            return Ok(());
        };
        let state = self.state.read();
        if let Some(coll) = state.collections.get(&cursor.ns) {
            for stored in coll.docs.iter().filter(|d| d.ts > tail.scanned_to) {
                if !matches_filter(&stored.doc, &tail.filter)? || !self.owns(tail.owned.as_ref(), &stored.doc) {
                    continue;
                }
                let mut doc = stored.doc.clone();
                if tail.sorted {
                    if let Some(obj) = doc.as_object_mut() {
                        obj.insert(SORT_KEY_FIELD.to_string(), json!([stored.ts.as_u64()]));
                    }
                }
                if let Some(projection) = &tail.projection {
                    doc = apply_projection(&doc, projection)?;
                }
                cursor.pending.push_back((stored.ts, doc));
            }
        }
        tail.scanned_to = self.clock.peek();
        Ok(())
    }

    async fn get_more(&self, cursor_id: u64, batch_size: Option<u32>, max_time_ms: Option<u64>) -> Result<ShardResponse> {
        let mut cursor = {
            let mut state = self.state.write();
            let cursor = state
                .cursors
                .remove(&cursor_id)
                .ok_or(ShardgateError::CursorNotFound(cursor_id))?;
            let current = state.collections.get(&cursor.ns).map(|c| c.incarnation);
            if current != Some(cursor.incarnation) {
                debug!(shard = %self.id, ns = %cursor.ns, cursor_id, "cursor outlived its collection");
                return Err(ShardgateError::StaleEpoch {
                    ns: cursor.ns.clone(),
                    received: cursor.version.unwrap_or(ChunkVersion::UNSHARDED),
                    wanted: None,
                });
            }
            cursor
        };

        if cursor.tail.is_some() && cursor.pending.is_empty() {
            let wait = max_time_ms
                .map(Duration::from_millis)
                .unwrap_or(self.params.await_data_timeout);
            let deadline = Instant::now() + wait;
            loop {
                let notified = self.inserted.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                self.scan_tail(&mut cursor)?;
                if !cursor.pending.is_empty() || max_time_ms.is_none() {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }
        }
        Ok(ShardResponse::Cursor(self.next_batch(cursor, batch_size, Some(cursor_id))))
    }

    /// Receiver for a write blocked by a migration critical section, if any
    /// of `docs` falls into one.
    fn blocking_critical_section(&self, ns: &Namespace, docs: &[Value]) -> Option<watch::Receiver<bool>> {
        let state = self.state.read();
        state
            .migrations
            .values()
            .filter(|m| &m.ns == ns && *m.critical.borrow())
            .find(|m| {
                docs.iter().any(|d| {
                    m.key_pattern
                        .extract_from_document(d)
                        .map(|k| m.range.contains(&k))
                        .unwrap_or(false)
                })
            })
            .map(|m| m.critical.subscribe())
    }

    async fn insert(&self, ns: Namespace, version: Option<ChunkVersion>, mut documents: Vec<Value>) -> Result<ShardResponse> {
        for doc in documents.iter_mut() {
            let Some(obj) = doc.as_object_mut() else {
                return Err(ShardgateError::BadValue(format!("document must be an object, got {doc}")));
            };
            obj.entry("_id").or_insert_with(|| json!(Uuid::new_v4().to_string()));
        }

        loop {
            let filtering = self.checked_filtering(&ns, version).await?;
            if let Some(mut rx) = self.blocking_critical_section(&ns, &documents) {
                debug!(shard = %self.id, %ns, "write waiting for migration critical section");
                let wait = rx.wait_for(|critical| !*critical);
                if tokio::time::timeout(self.params.critical_section_timeout, wait)
                    .await
                    .is_err()
                {
                    return Err(ShardgateError::ExceededTimeLimit);
                }
                continue;
            }

            let owned = filtering.as_ref().and_then(|f| f.map());
            if let Some(map) = owned {
                for doc in &documents {
                    if !self.owns(Some(map), doc) {
                        return Err(ShardgateError::StaleShardVersion {
                            ns: ns.clone(),
                            shard: self.id.clone(),
                            received: version.unwrap_or(ChunkVersion::UNSHARDED),
                            wanted: Some(map.shard_version(&self.id)),
                        });
                    }
                }
            }

            let mut state = self.state.write();
            let NodeState {
                collections,
                migrations,
                ..
            } = &mut *state;
            let coll = collections.entry(ns.clone()).or_insert_with(StoredCollection::new);
            let n = documents.len() as u64;
            for doc in documents {
                for source in migrations.values_mut().filter(|m| m.ns == ns) {
                    let in_range = source
                        .key_pattern
                        .extract_from_document(&doc)
                        .map(|k| source.range.contains(&k))
                        .unwrap_or(false);
                    if in_range {
                        source.mods.push(doc.clone());
                    }
                }
                coll.docs.push(StoredDoc {
                    ts: self.clock.tick(),
                    doc,
                });
            }
            drop(state);
            self.inserted.notify_waiters();
            return Ok(ShardResponse::Inserted { n });
        }
    }

    async fn count(&self, ns: Namespace, version: Option<ChunkVersion>, filter: Value) -> Result<ShardResponse> {
        let filtering = self.checked_filtering(&ns, version).await?;
        let owned = filtering.as_ref().and_then(|f| f.map());
        let filter = if filter.is_null() { json!({}) } else { filter };
        let state = self.state.read();
        let mut n = 0;
        if let Some(coll) = state.collections.get(&ns) {
            for stored in &coll.docs {
                if matches_filter(&stored.doc, &filter)? && self.owns(owned, &stored.doc) {
                    n += 1;
                }
            }
        }
        Ok(ShardResponse::Count { n })
    }

    /// Keys that cut the documents of `range` into pieces of roughly half
    /// the maximum chunk size. A range holding a single key value yields no
    /// points even when it is too large.
    fn split_vector(
        &self,
        ns: &Namespace,
        range: &KeyRange,
        pattern: &ShardKeyPattern,
        max_chunk_size_bytes: u64,
    ) -> Result<Vec<ShardKey>> {
        let mut keyed: Vec<(ShardKey, u64)> = {
            let state = self.state.read();
            let Some(coll) = state.collections.get(ns) else {
                return Ok(Vec::new());
            };
            let mut keyed = Vec::new();
            for stored in &coll.docs {
                let key = pattern.extract_from_document(&stored.doc)?;
                if range.contains(&key) {
                    keyed.push((key, serde_json::to_vec(&stored.doc)?.len() as u64));
                }
            }
            keyed
        };
        let total: u64 = keyed.iter().map(|(_, size)| size).sum();
        if total <= max_chunk_size_bytes {
            return Ok(Vec::new());
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let target = (max_chunk_size_bytes / 2).max(1);
        let first = keyed[0].0.clone();
        let mut points: Vec<ShardKey> = Vec::new();
        let mut acc = 0;
        for (key, size) in keyed {
            if acc >= target && key != first && points.last() != Some(&key) {
                points.push(key);
                acc = 0;
            }
            acc += size;
        }
        if points.is_empty() {
            return Err(ShardgateError::ChunkTooBig(format!(
                "{range} of {ns} holds {total} bytes under a single key value"
            )));
        }
        Ok(points)
    }

    async fn check_split(
        &self,
        ns: Namespace,
        range: KeyRange,
        points: Vec<ShardKey>,
        expected: ChunkVersion,
    ) -> Result<ShardResponse> {
        let Filtering::Sharded(map) = self.refresh(&ns).await? else {
            return Err(ShardgateError::IllegalOperation(format!("{ns} is not sharded")));
        };
        if !expected.same_epoch(&map.collection_version()) {
            return Err(ShardgateError::StaleEpoch {
                ns,
                received: expected,
                wanted: Some(map.collection_version()),
            });
        }
        let chunk = map.find_intersecting_chunk(&range.min)?;
        if chunk.range != range || chunk.shard != self.id {
            return Err(ShardgateError::ConflictingOperationInProgress(format!(
                "chunk {range} is not owned by {} as a whole",
                self.id
            )));
        }
        let mut prev = &range.min;
        for point in &points {
            if point <= prev || point >= &range.max {
                return Err(ShardgateError::BadValue(format!(
                    "split point {point} is not inside {range} in ascending order"
                )));
            }
            prev = point;
        }
        Ok(ShardResponse::Ok)
    }

    async fn start_migration(&self, ns: Namespace, id: Uuid, range: KeyRange, to: ShardId) -> Result<ShardResponse> {
        let Filtering::Sharded(map) = self.refresh(&ns).await? else {
            return Err(ShardgateError::IllegalOperation(format!("{ns} is not sharded")));
        };
        let chunk = map.find_intersecting_chunk(&range.min)?;
        if chunk.range != range || chunk.shard != self.id {
            return Err(ShardgateError::ConflictingOperationInProgress(format!(
                "chunk {range} of {ns} is not owned by {}",
                self.id
            )));
        }
        let mut state = self.state.write();
        if let Some(other) = state.migrations.values().find(|m| m.ns == ns) {
            return Err(ShardgateError::ConflictingOperationInProgress(format!(
                "{ns} is already migrating {} to {}",
                other.range, other.to
            )));
        }
        let (critical, _) = watch::channel(false);
        state.migrations.insert(
            id,
            MigrationSource {
                ns: ns.clone(),
                range: range.clone(),
                key_pattern: map.key_pattern().clone(),
                to: to.clone(),
                mods: Vec::new(),
                critical,
            },
        );
        info!(shard = %self.id, %ns, %range, %to, "migration source started");
        Ok(ShardResponse::Ok)
    }

    fn clone_batch(&self, id: Uuid, offset: usize, batch_size: usize) -> Result<ShardResponse> {
        let state = self.state.read();
        let source = state
            .migrations
            .get(&id)
            .ok_or_else(|| ShardgateError::NoMatchingDocument(format!("migration {id}")))?;
        let in_range: Vec<&StoredDoc> = state
            .collections
            .get(&source.ns)
            .map(|c| {
                c.docs
                    .iter()
                    .filter(|d| {
                        source
                            .key_pattern
                            .extract_from_document(&d.doc)
                            .map(|k| source.range.contains(&k))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let docs: Vec<Value> = in_range
            .iter()
            .skip(offset)
            .take(batch_size.max(1))
            .map(|d| d.doc.clone())
            .collect();
        let done = offset + docs.len() >= in_range.len();
        Ok(ShardResponse::Documents { docs, done })
    }

    /// Store incoming documents, replacing any with the same `_id`.
    fn receive(&self, ns: &Namespace, documents: Vec<Value>) -> u64 {
        let mut state = self.state.write();
        let coll = state
            .collections
            .entry(ns.clone())
            .or_insert_with(StoredCollection::new);
        let n = documents.len() as u64;
        for doc in documents {
            let ts = self.clock.tick();
            let id = doc.get("_id").cloned();
            match coll
                .docs
                .iter_mut()
                .find(|d| id.is_some() && d.doc.get("_id") == id.as_ref())
            {
                Some(existing) => *existing = StoredDoc { ts, doc },
                None => coll.docs.push(StoredDoc { ts, doc }),
            }
        }
        n
    }

    fn enter_critical_section(&self, id: Uuid) -> Result<ShardResponse> {
        let mut state = self.state.write();
        let source = state
            .migrations
            .get_mut(&id)
            .ok_or_else(|| ShardgateError::NoMatchingDocument(format!("migration {id}")))?;
        source.critical.send_replace(true);
        let docs = std::mem::take(&mut source.mods);
        debug!(shard = %self.id, ns = %source.ns, pending = docs.len(), "entered critical section");
        Ok(ShardResponse::Documents { docs, done: true })
    }

    /// Leave the critical section. Blocked writers wake up, re-check their
    /// version against fresh metadata and fail stale if the range moved.
    fn finish_migration(&self, id: Uuid, committed: bool) {
        let mut state = self.state.write();
        let Some(source) = state.migrations.remove(&id) else {
            return;
        };
        if committed {
            state.filtering.remove(&source.ns);
        }
        source.critical.send_replace(false);
        info!(shard = %self.id, ns = %source.ns, range = %source.range, committed, "migration source finished");
    }

    async fn delete_range(&self, ns: Namespace, range: KeyRange) -> Result<ShardResponse> {
        let Filtering::Sharded(map) = self.refresh(&ns).await? else {
            return Ok(ShardResponse::Deleted { n: 0 });
        };
        if map.chunks_for_range(&range.min, &range.max).iter().any(|c| c.shard == self.id) {
            return Err(ShardgateError::IllegalOperation(format!(
                "{} owns part of {range} of {ns}",
                self.id
            )));
        }
        let pattern = map.key_pattern();
        let mut state = self.state.write();
        let Some(coll) = state.collections.get_mut(&ns) else {
            return Ok(ShardResponse::Deleted { n: 0 });
        };
        let before = coll.docs.len();
        coll.docs.retain(|d| {
            pattern
                .extract_from_document(&d.doc)
                .map(|k| !range.contains(&k))
                .unwrap_or(true)
        });
        let n = (before - coll.docs.len()) as u64;
        if n > 0 {
            info!(shard = %self.id, %ns, %range, n, "deleted orphaned range");
        } else {
            warn!(shard = %self.id, %ns, %range, "range deletion found nothing to delete");
        }
        Ok(ShardResponse::Deleted { n })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CollectionEntry, DatabaseEntry, ShardEntry};
    use crate::catalog_store::InMemoryCatalog;
    use crate::chunk::Chunk;
    use crate::key::KeyValue;
    use crate::query::Collation;
    use crate::registry::ConnectionString;
    use crate::version::Epoch;

    fn k(v: i64) -> ShardKey {
        ShardKey::new(vec![KeyValue::Int(v)])
    }

    struct Fixture {
        catalog: Arc<InMemoryCatalog>,
        node: InMemoryShard,
        ns: Namespace,
        version: ChunkVersion,
    }

    /// `db.c` sharded on `x` with `[MIN, 10)` on `a` and `[10, MAX)` on `b`.
    async fn fixture() -> Result<Fixture> {
        let catalog = Arc::new(InMemoryCatalog::new());
        for id in ["a", "b"] {
            catalog
                .add_shard(ShardEntry {
                    id: id.into(),
                    connection_string: ConnectionString::parse(&format!("{id}:1"))?,
                    max_size_bytes: 0,
                    draining: false,
                })
                .await?;
        }
        catalog
            .upsert_database(DatabaseEntry {
                name: "db".into(),
                primary: "a".into(),
                sharding_enabled: true,
                version: Uuid::new_v4(),
            })
            .await?;
        let ns = Namespace::new("db", "c");
        let epoch = Epoch::generate();
        let entry = CollectionEntry {
            ns: ns.clone(),
            uuid: Uuid::new_v4(),
            epoch,
            key_pattern: ShardKeyPattern::new(vec!["x"])?,
            default_collation: Collation::simple(),
            unique: false,
            dropped: false,
            updated_at: Timestamp::ZERO,
        };
        let chunks = vec![
            Chunk::new(
                entry.uuid,
                KeyRange::new(ShardKey::global_min(1), k(10))?,
                "a".into(),
                ChunkVersion::new(epoch, 1, 0),
                Timestamp::ZERO,
            ),
            Chunk::new(
                entry.uuid,
                KeyRange::new(k(10), ShardKey::global_max(1))?,
                "b".into(),
                ChunkVersion::new(epoch, 1, 1),
                Timestamp::ZERO,
            ),
        ];
        catalog.replace_collection(entry, chunks, Vec::new()).await?;
        let node = InMemoryShard::new(
            "a".into(),
            catalog.clone(),
            Arc::new(ClusterClock::new()),
            ClusterParams::for_tests(),
        );
        Ok(Fixture {
            catalog,
            node,
            ns,
            version: ChunkVersion::new(epoch, 1, 0),
        })
    }

    fn find(filter: Value) -> ShardCommand {
        ShardCommand::Find(FindCommand {
            filter,
            ..FindCommand::default()
        })
    }

    #[tokio::test]
    async fn versioned_reads_filter_orphans() -> Result<()> {
        let f = fixture().await?;
        let docs = vec![json!({"x": 1}), json!({"x": 15})];
        f.node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::RecvChunk {
                migration_id: Uuid::new_v4(),
                documents: docs,
            }))
            .await?;
        let owned = f
            .node
            .handle(ShardRequest::versioned(f.ns.clone(), f.version, find(json!({}))))
            .await?
            .into_cursor()?;
        assert_eq!(owned.batch.len(), 1);
        assert_eq!(owned.batch[0]["x"], 1);
        assert_eq!(owned.cursor_id, 0);

        let everything = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), find(Value::Null)))
            .await?
            .into_cursor()?;
        assert_eq!(everything.batch.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn stale_versions_are_reported_with_the_local_version() -> Result<()> {
        let f = fixture().await?;
        let ahead = ChunkVersion::new(f.version.epoch, 2, 0);
        let err = f
            .node
            .handle(ShardRequest::versioned(f.ns.clone(), ahead, find(json!({}))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardgateError::StaleShardVersion { wanted: Some(w), .. } if w == f.version
        ));

        let other_epoch = ChunkVersion::new(Epoch::generate(), 1, 0);
        let err = f
            .node
            .handle(ShardRequest::versioned(f.ns.clone(), other_epoch, find(json!({}))))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardgateError::StaleEpoch { .. }));

        let err = f
            .node
            .handle(ShardRequest::versioned(f.ns.clone(), ChunkVersion::UNSHARDED, find(json!({}))))
            .await
            .unwrap_err();
        assert!(err.is_stale_routing());
        Ok(())
    }

    #[tokio::test]
    async fn cursors_page_and_die_with_their_collection() -> Result<()> {
        let f = fixture().await?;
        let docs: Vec<Value> = (0..5).map(|i| json!({"x": i})).collect();
        f.node
            .handle(ShardRequest::versioned(f.ns.clone(), f.version, ShardCommand::Insert { documents: docs }))
            .await?;
        let first = f
            .node
            .handle(ShardRequest::versioned(
                f.ns.clone(),
                f.version,
                ShardCommand::Find(FindCommand {
                    filter: json!({}),
                    sort: Some(json!({"x": -1})),
                    batch_size: Some(2),
                    ..FindCommand::default()
                }),
            ))
            .await?
            .into_cursor()?;
        assert_eq!(first.batch[0]["x"], 4);
        assert_eq!(first.batch[0][SORT_KEY_FIELD], json!([4]));
        assert_ne!(first.cursor_id, 0);

        let more = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::GetMore {
                cursor_id: first.cursor_id,
                batch_size: Some(2),
                max_time_ms: None,
            }))
            .await?
            .into_cursor()?;
        assert_eq!(more.batch.len(), 2);
        assert_eq!(more.cursor_id, first.cursor_id);

        f.node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::DropCollection))
            .await?;
        let err = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::GetMore {
                cursor_id: first.cursor_id,
                batch_size: None,
                max_time_ms: None,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardgateError::StaleEpoch { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn tailable_cursors_report_high_water_marks() -> Result<()> {
        let f = fixture().await?;
        let opened = f
            .node
            .handle(ShardRequest::versioned(
                f.ns.clone(),
                f.version,
                ShardCommand::Find(FindCommand {
                    filter: json!({}),
                    sort: Some(json!({"$clusterTime": 1})),
                    tailable: true,
                    await_data: true,
                    ..FindCommand::default()
                }),
            ))
            .await?
            .into_cursor()?;
        assert!(opened.batch.is_empty());
        assert_ne!(opened.cursor_id, 0);
        let first_mark = opened.post_batch_resume_token.expect("high-water mark");

        let empty = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::GetMore {
                cursor_id: opened.cursor_id,
                batch_size: None,
                max_time_ms: Some(10),
            }))
            .await?
            .into_cursor()?;
        assert!(empty.batch.is_empty());

        f.node
            .handle(ShardRequest::versioned(f.ns.clone(), f.version, ShardCommand::Insert {
                documents: vec![json!({"x": 3})],
            }))
            .await?;
        let got = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::GetMore {
                cursor_id: opened.cursor_id,
                batch_size: None,
                max_time_ms: Some(10),
            }))
            .await?
            .into_cursor()?;
        assert_eq!(got.batch.len(), 1);
        let mark = got.post_batch_resume_token.expect("high-water mark");
        assert!(mark > first_mark);
        assert_eq!(got.batch[0][SORT_KEY_FIELD], json!([mark.as_u64()]));
        Ok(())
    }

    #[tokio::test]
    async fn demoted_nodes_refuse_everything_but_hello() -> Result<()> {
        let f = fixture().await?;
        f.node.set_primary(false);
        let err = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), find(json!({}))))
            .await
            .unwrap_err();
        assert!(err.is_not_master());
        let hello = f
            .node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::Hello))
            .await?;
        assert_eq!(hello, ShardResponse::Hello {
            shard: "a".into(),
            is_primary: false
        });
        Ok(())
    }

    #[tokio::test]
    async fn split_vector_needs_distinct_keys() -> Result<()> {
        let f = fixture().await?;
        let pattern = ShardKeyPattern::new(vec!["x"])?;
        let range = KeyRange::new(ShardKey::global_min(1), k(10))?;
        let docs: Vec<Value> = (0..8).map(|i| json!({"x": i, "pad": "0123456789"})).collect();
        f.node.receive(&f.ns, docs);
        let points = f.node.split_vector(&f.ns, &range, &pattern, 100)?;
        assert!(!points.is_empty());
        assert!(points.windows(2).all(|w| w[0] < w[1]));

        let same: Vec<Value> = (0..8).map(|i| json!({"_id": 100 + i, "x": -1, "pad": "0123456789"})).collect();
        let single = Namespace::new("db", "same");
        f.node.receive(&single, same);
        assert!(matches!(
            f.node.split_vector(&single, &range, &pattern, 100),
            Err(ShardgateError::ChunkTooBig(_))
        ));
        assert!(f.node.split_vector(&single, &range, &pattern, 1 << 20)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn critical_section_blocks_writes_until_commit() -> Result<()> {
        let f = fixture().await?;
        let node = Arc::new(f.node);
        let range = KeyRange::new(ShardKey::global_min(1), k(10))?;
        let id = Uuid::new_v4();
        node.handle(ShardRequest::new(f.ns.clone(), ShardCommand::MoveChunk {
            migration_id: id,
            range: range.clone(),
            to: "b".into(),
        }))
        .await?;
        node.handle(ShardRequest::versioned(f.ns.clone(), f.version, ShardCommand::Insert {
            documents: vec![json!({"x": 1})],
        }))
        .await?;
        let ShardResponse::Documents { docs, .. } = node
            .handle(ShardRequest::new(f.ns.clone(), ShardCommand::EnterCriticalSection { migration_id: id }))
            .await?
        else {
            panic!("expected captured writes");
        };
        assert_eq!(docs.len(), 1);

        let writer = {
            let node = node.clone();
            let ns = f.ns.clone();
            let version = f.version;
            tokio::spawn(async move {
                node.handle(ShardRequest::versioned(ns, version, ShardCommand::Insert {
                    documents: vec![json!({"x": 2})],
                }))
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        // Hand the range to "b" in the catalog, then release the donor.
        let map = ChunkMap::build(
            f.catalog.get_collection(&f.ns).await?.expect("collection").metadata(),
            f.catalog.get_chunks(&f.ns, None).await?,
        )?;
        let moved = map
            .find_intersecting_chunk(&k(0))?
            .with_new_owner("b".into(), ChunkVersion::new(f.version.epoch, 2, 0), Timestamp::new(1, 0), 10);
        f.catalog
            .commit_chunk_changes(&f.ns, map.collection_version(), vec![moved.range.min.clone()], vec![moved])
            .await?;
        node.handle(ShardRequest::new(f.ns.clone(), ShardCommand::CommitMigration { migration_id: id }))
            .await?;

        let res = writer.await.expect("writer task");
        assert!(matches!(res, Err(ShardgateError::StaleShardVersion { .. }) | Err(ShardgateError::StaleEpoch { .. })));
        Ok(())
    }
}
