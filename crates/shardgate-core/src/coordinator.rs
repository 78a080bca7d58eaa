//! Chunk lifecycle coordinator. Every change to the sharded layout goes
//! through here: the catalog is updated under an expected collection
//! version, then the shards involved are told to refresh.

use crate::catalog::{
    CatalogClient, CollectionEntry, DatabaseEntry, MigrationDocument, MigrationState, RangeDeletionTask, ShardEntry,
    TagRange,
};
use crate::chunk::Chunk;
use crate::chunk_map::ChunkMap;
use crate::clock::ClusterClock;
use crate::config::ClusterParams;
use crate::dist_lock::{DistLockGuard, DistLockManager};
use crate::error::{Result, ShardgateError};
use crate::key::{KeyRange, KeyValue, ShardKey, ShardKeyPattern};
use crate::namespace::{Namespace, ShardId};
use crate::op_context::OperationContext;
use crate::query::Collation;
use crate::range_deleter::RangeDeleter;
use crate::registry::ConnectionString;
use crate::router::Router;
use crate::transport::{ShardCommand, ShardRequest, ShardResponse};
use crate::version::{ChunkVersion, Epoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveChunkOptions {
    /// Move a chunk flagged jumbo anyway.
    #[serde(default)]
    pub force_jumbo: bool,
    /// Delete the donor's copy before returning instead of in the background.
    #[serde(default)]
    pub wait_for_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub ns: Namespace,
    pub range: KeyRange,
    pub from: ShardId,
    pub to: ShardId,
    /// Collection version after the commit.
    pub version: ChunkVersion,
    pub cloned: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AutoSplitOutcome {
    NotNeeded,
    Split { pieces: usize, version: ChunkVersion },
    /// No split point exists; the chunk is now flagged jumbo.
    Jumbo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RemoveShardStatus {
    Started { chunks: usize, databases: Vec<String> },
    Ongoing { chunks: usize, databases: Vec<String> },
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub completed: Vec<Uuid>,
    pub aborted: Vec<Uuid>,
}

pub struct Coordinator {
    router: Router,
    clock: Arc<ClusterClock>,
    locks: DistLockManager,
    /// Serialises catalog commits issued by this process.
    chunk_op_lock: Mutex<()>,
    range_deleter: RangeDeleter,
}

async fn release(lock: DistLockGuard) {
    let name = lock.name().to_string();
    if let Err(e) = lock.release().await {
        warn!(lock = %name, error = %e, "failed to release distributed lock");
    }
}

/// Bounds of a refined key: the global max keeps its meaning, every other
/// bound gains `MinKey` for the new fields.
fn refine_bound(key: &ShardKey, len: usize) -> ShardKey {
    if key.is_global_max() {
        key.extend_with(len, KeyValue::MaxKey)
    } else {
        key.extend_with(len, KeyValue::MinKey)
    }
}

fn refine_range(range: &KeyRange, len: usize) -> Result<KeyRange> {
    KeyRange::new(refine_bound(&range.min, len), refine_bound(&range.max, len))
}

fn unexpected(command: &str, reply: ShardResponse) -> ShardgateError {
    ShardgateError::Internal(format!("unexpected reply to {command}: {reply:?}"))
}

impl Coordinator {
    pub fn new(router: Router, clock: Arc<ClusterClock>, process_id: impl Into<String>) -> Self {
        let params = router.params();
        let locks = DistLockManager::new(
            router.catalog().clone(),
            process_id,
            params.lock_lease,
            params.lock_retry_interval,
            params.lock_wait,
        );
        Self {
            range_deleter: RangeDeleter::new(router.clone()),
            router,
            clock,
            locks,
            chunk_op_lock: Mutex::new(()),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn range_deleter(&self) -> &RangeDeleter {
        &self.range_deleter
    }

    pub fn locks(&self) -> &DistLockManager {
        &self.locks
    }

    fn catalog(&self) -> &Arc<dyn CatalogClient> {
        self.router.catalog()
    }

    fn params(&self) -> &ClusterParams {
        self.router.params()
    }

    /// Cleanup runs under its own deadline so it still happens when the
    /// operation that failed ran out of time.
    fn cleanup_ctx(&self) -> OperationContext {
        OperationContext::with_timeout(self.params().default_op_timeout)
    }

    async fn send(&self, ctx: &OperationContext, shard: &ShardId, ns: &Namespace, command: ShardCommand) -> Result<ShardResponse> {
        self.router
            .send_to_primary(ctx, shard, ShardRequest::new(ns.clone(), command))
            .await
    }

    /// The catalog's view of a sharded collection.
    async fn authoritative_map(&self, ns: &Namespace) -> Result<(CollectionEntry, ChunkMap)> {
        let entry = self
            .catalog()
            .get_collection(ns)
            .await?
            .filter(|e| !e.dropped)
            .ok_or_else(|| ShardgateError::NamespaceNotFound(format!("{ns} is not sharded")))?;
        let chunks = self.catalog().get_chunks(ns, None).await?;
        let map = ChunkMap::build(entry.metadata(), chunks)?;
        Ok((entry, map))
    }

    async fn flush_shards(&self, ctx: &OperationContext, ns: &Namespace, shards: BTreeSet<ShardId>) {
        let flushes = shards.into_iter().map(|shard| async move {
            if let Err(e) = self
                .send(ctx, &shard, ns, ShardCommand::FlushRoutingTableCacheUpdates)
                .await
            {
                warn!(%ns, %shard, error = %e, "shard did not refresh its routing metadata");
            }
        });
        futures::future::join_all(flushes).await;
    }

    async fn after_commit(&self, ctx: &OperationContext, ns: &Namespace, version: ChunkVersion, shards: BTreeSet<ShardId>) {
        self.router.routing().on_stale_config(ns, Some(version), None);
        self.flush_shards(ctx, ns, shards).await;
    }

    async fn active_shards(&self) -> Result<Vec<ShardEntry>> {
        let mut shards: Vec<ShardEntry> = self
            .catalog()
            .list_shards()
            .await?
            .into_iter()
            .filter(|s| !s.draining)
            .collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(shards)
    }

    // ---- databases ----

    async fn pick_primary(&self, requested: Option<ShardId>) -> Result<ShardId> {
        let active = self.active_shards().await?;
        if let Some(id) = requested {
            return match active.iter().find(|s| s.id == id) {
                Some(_) => Ok(id),
                None => Err(ShardgateError::ShardNotFound(format!("{id} is unknown or draining"))),
            };
        }
        let mut load: BTreeMap<ShardId, usize> = active.iter().map(|s| (s.id.clone(), 0)).collect();
        for db in self.catalog().list_databases().await? {
            if let Some(n) = load.get_mut(&db.primary) {
                *n += 1;
            }
        }
        load.into_iter()
            .min_by_key(|(_, n)| *n)
            .map(|(id, _)| id)
            .ok_or_else(|| ShardgateError::ShardNotFound("no shard available for a new database".to_string()))
    }

    /// Create `db` if it does not exist, on `primary` or the shard that is
    /// primary for the fewest databases.
    pub async fn create_database(&self, db: &str, primary: Option<ShardId>) -> Result<DatabaseEntry> {
        let lock = self.locks.lock(db, "createDatabase", None).await?;
        let result = self.ensure_database(db, primary, false).await;
        release(lock).await;
        result
    }

    pub async fn enable_sharding(&self, db: &str, primary: Option<ShardId>) -> Result<DatabaseEntry> {
        let lock = self.locks.lock(db, "enableSharding", None).await?;
        let result = self.ensure_database(db, primary, true).await;
        release(lock).await;
        result
    }

    async fn ensure_database(&self, db: &str, primary: Option<ShardId>, sharding: bool) -> Result<DatabaseEntry> {
        if db.is_empty() || db.contains('.') || db == ShardId::CONFIG || db == "admin" {
            return Err(ShardgateError::BadValue(format!("invalid database name '{db}'")));
        }
        let entry = match self.catalog().get_database(db).await {
            Ok(entry) if entry.sharding_enabled || !sharding => return Ok(entry),
            Ok(entry) => DatabaseEntry {
                sharding_enabled: true,
                ..entry
            },
            Err(ShardgateError::NamespaceNotFound(_)) => DatabaseEntry {
                name: db.to_string(),
                primary: self.pick_primary(primary).await?,
                sharding_enabled: sharding,
                version: Uuid::new_v4(),
            },
            Err(e) => return Err(e),
        };
        self.catalog().upsert_database(entry.clone()).await?;
        self.router.routing().purge_database(db);
        info!(db, primary = %entry.primary, sharding, "database updated");
        Ok(entry)
    }

    /// Make `to` the primary of `db`. Refused while the current primary
    /// still holds unsharded collections of the database.
    pub async fn move_primary(&self, ctx: &OperationContext, db: &str, to: &ShardId) -> Result<DatabaseEntry> {
        let lock = self.locks.lock(db, "movePrimary", None).await?;
        let result = self.move_primary_locked(ctx, db, to).await;
        release(lock).await;
        result
    }

    async fn move_primary_locked(&self, ctx: &OperationContext, db: &str, to: &ShardId) -> Result<DatabaseEntry> {
        let entry = self.catalog().get_database(db).await?;
        if &entry.primary == to {
            return Ok(entry);
        }
        let to = self.pick_primary(Some(to.clone())).await?;
        let sharded: BTreeSet<String> = self
            .catalog()
            .list_collections(Some(db))
            .await?
            .into_iter()
            .filter(|c| !c.dropped)
            .map(|c| c.ns.coll)
            .collect();
        let listed = match self
            .send(ctx, &entry.primary, &Namespace::new(db, "$cmd"), ShardCommand::ListCollections)
            .await?
        {
            ShardResponse::Items(items) => items,
            other => return Err(unexpected("listCollections", other)),
        };
        let unsharded: Vec<&str> = listed
            .iter()
            .filter_map(|item| item.get("name").and_then(Value::as_str))
            .filter(|name| !sharded.contains(*name))
            .collect();
        if !unsharded.is_empty() {
            return Err(ShardgateError::IllegalOperation(format!(
                "{} still holds unsharded collections of {db}: {}",
                entry.primary,
                unsharded.join(", ")
            )));
        }
        let moved = DatabaseEntry {
            primary: to,
            version: Uuid::new_v4(),
            ..entry
        };
        self.catalog().upsert_database(moved.clone()).await?;
        self.router.routing().purge_database(db);
        info!(db, primary = %moved.primary, "database primary moved");
        Ok(moved)
    }

    // ---- collections ----

    /// Shard `ns` on `key_pattern`, pre-split at `split_points`. An empty
    /// collection has its chunks spread round-robin starting at the primary;
    /// existing data keeps every chunk on the primary. Sharding again with
    /// the same key is a no-op.
    pub async fn shard_collection(
        &self,
        ctx: &OperationContext,
        ns: &Namespace,
        key_pattern: ShardKeyPattern,
        unique: bool,
        split_points: Vec<ShardKey>,
        collation: Option<Collation>,
    ) -> Result<ChunkVersion> {
        let db = self.catalog().get_database(&ns.db).await?;
        if !db.sharding_enabled {
            return Err(ShardgateError::IllegalOperation(format!(
                "sharding is not enabled for database {}",
                ns.db
            )));
        }
        let lock = self.locks.lock(&ns.lock_name(), "shardCollection", None).await?;
        let result = self
            .shard_collection_locked(ctx, &db, ns, key_pattern, unique, split_points, collation)
            .await;
        release(lock).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn shard_collection_locked(
        &self,
        ctx: &OperationContext,
        db: &DatabaseEntry,
        ns: &Namespace,
        key_pattern: ShardKeyPattern,
        unique: bool,
        mut split_points: Vec<ShardKey>,
        collation: Option<Collation>,
    ) -> Result<ChunkVersion> {
        if let Some(existing) = self.catalog().get_collection(ns).await?.filter(|e| !e.dropped) {
            if existing.key_pattern != key_pattern {
                return Err(ShardgateError::IllegalOperation(format!(
                    "{ns} is already sharded on {}",
                    existing.key_pattern
                )));
            }
            let (_, map) = self.authoritative_map(ns).await?;
            return Ok(map.collection_version());
        }

        split_points.sort();
        split_points.dedup();
        let mut bounds = vec![key_pattern.global_min()];
        for point in split_points {
            if !key_pattern.is_valid_key(&point) || point.is_global_min() || point.is_global_max() {
                return Err(ShardgateError::BadValue(format!(
                    "invalid split point {point} for shard key {key_pattern}"
                )));
            }
            bounds.push(point);
        }
        bounds.push(key_pattern.global_max());

        let existing_docs = match self
            .send(ctx, &db.primary, ns, ShardCommand::Count { filter: json!({}) })
            .await?
        {
            ShardResponse::Count { n } => n,
            other => return Err(unexpected("count", other)),
        };
        let owners: Vec<ShardId> = if existing_docs > 0 {
            vec![db.primary.clone()]
        } else {
            let mut active: Vec<ShardId> = self.active_shards().await?.into_iter().map(|s| s.id).collect();
            match active.iter().position(|s| s == &db.primary) {
                Some(at) => active.rotate_left(at),
                None => active.insert(0, db.primary.clone()),
            }
            active
        };

        let epoch = Epoch::generate();
        let uuid = Uuid::new_v4();
        let at = self.clock.tick();
        let chunks = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                Ok(Chunk::new(
                    uuid,
                    KeyRange::new(w[0].clone(), w[1].clone())?,
                    owners[i % owners.len()].clone(),
                    ChunkVersion::new(epoch, 1, i as u32),
                    at,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let version = ChunkVersion::new(epoch, 1, (chunks.len() - 1) as u32);
        let touched: BTreeSet<ShardId> = chunks.iter().map(|c| c.shard.clone()).chain([db.primary.clone()]).collect();
        let entry = CollectionEntry {
            ns: ns.clone(),
            uuid,
            epoch,
            key_pattern: key_pattern.clone(),
            default_collation: collation.unwrap_or_else(Collation::simple),
            unique,
            dropped: false,
            updated_at: at,
        };
        let n = chunks.len();
        self.catalog().replace_collection(entry, chunks, Vec::new()).await?;

        let index = json!({"name": "shard_key", "key": key_pattern.to_json(), "unique": unique});
        if let Err(e) = self
            .send(ctx, &db.primary, ns, ShardCommand::CreateIndexes { indexes: vec![index] })
            .await
        {
            warn!(%ns, error = %e, "could not create the shard key index");
        }
        self.router.routing().purge(ns);
        self.flush_shards(ctx, ns, touched).await;
        info!(%ns, key = %key_pattern, chunks = n, %version, "collection sharded");
        Ok(version)
    }

    /// Drop `ns` from the catalog and from every shard.
    pub async fn drop_collection(&self, ctx: &OperationContext, ns: &Namespace) -> Result<()> {
        let lock = self.locks.lock(&ns.lock_name(), "dropCollection", None).await?;
        let result = self.drop_locked(ctx, ns).await;
        release(lock).await;
        result
    }

    async fn drop_locked(&self, ctx: &OperationContext, ns: &Namespace) -> Result<()> {
        let sharded = self.catalog().get_collection(ns).await?.is_some_and(|e| !e.dropped);
        let targets: Vec<ShardId> = if sharded {
            // Dropped in the catalog first so shards refreshing meanwhile
            // already see it gone.
            self.catalog().drop_collection(ns).await?;
            for task in self.catalog().list_range_deletions().await? {
                if &task.ns == ns {
                    self.catalog().remove_range_deletion(task.id).await?;
                }
            }
            self.router.reload_shards().await?;
            self.router.registry().all_shard_ids()
        } else {
            vec![self.catalog().get_database(&ns.db).await?.primary]
        };
        for shard in &targets {
            self.send(ctx, shard, ns, ShardCommand::DropCollection).await?;
        }
        self.router.routing().purge(ns);
        info!(%ns, sharded, shards = targets.len(), "collection dropped");
        Ok(())
    }

    /// Rename within one database. The target must not exist unless
    /// `drop_target` is set.
    pub async fn rename_collection(
        &self,
        ctx: &OperationContext,
        from: &Namespace,
        to: &Namespace,
        drop_target: bool,
    ) -> Result<()> {
        if from.db != to.db {
            return Err(ShardgateError::IllegalOperation(format!(
                "cannot rename {from} to {to} across databases"
            )));
        }
        if from == to {
            return Err(ShardgateError::BadValue(format!("cannot rename {from} onto itself")));
        }
        // Fixed order so two renames cannot deadlock.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let first_lock = self.locks.lock(&first.lock_name(), "renameCollection", None).await?;
        let second_lock = match self.locks.lock(&second.lock_name(), "renameCollection", None).await {
            Ok(lock) => lock,
            Err(e) => {
                release(first_lock).await;
                return Err(e);
            }
        };
        let result = self.rename_locked(ctx, from, to, drop_target).await;
        release(second_lock).await;
        release(first_lock).await;
        result
    }

    async fn primary_lists(&self, ctx: &OperationContext, primary: &ShardId, ns: &Namespace) -> Result<bool> {
        match self.send(ctx, primary, ns, ShardCommand::ListCollections).await? {
            ShardResponse::Items(items) => Ok(items
                .iter()
                .any(|i| i.get("name").and_then(Value::as_str) == Some(ns.coll.as_str()))),
            other => Err(unexpected("listCollections", other)),
        }
    }

    async fn rename_locked(&self, ctx: &OperationContext, from: &Namespace, to: &Namespace, drop_target: bool) -> Result<()> {
        let primary = self.catalog().get_database(&from.db).await?.primary;
        let target_sharded = self.catalog().get_collection(to).await?.is_some_and(|e| !e.dropped);
        if target_sharded || self.primary_lists(ctx, &primary, to).await? {
            if !drop_target {
                return Err(ShardgateError::IllegalOperation(format!("target namespace {to} exists")));
            }
            self.drop_locked(ctx, to).await?;
        }

        let sharded = self.catalog().get_collection(from).await?.is_some_and(|e| !e.dropped);
        let targets = if sharded {
            self.catalog().rename_collection(from, to, Epoch::generate()).await?;
            self.router.reload_shards().await?;
            self.router.registry().all_shard_ids()
        } else {
            if !self.primary_lists(ctx, &primary, from).await? {
                return Err(ShardgateError::NamespaceNotFound(from.to_string()));
            }
            vec![primary]
        };
        for shard in &targets {
            self.send(ctx, shard, from, ShardCommand::RenameCollection { to: to.clone() })
                .await?;
        }
        self.router.routing().purge(from);
        self.router.routing().purge(to);
        info!(%from, %to, sharded, "collection renamed");
        Ok(())
    }

    /// Extend the shard key of `ns` by appending fields. Chunk and zone
    /// bounds gain `MinKey` (`MaxKey` for the global max) and the collection
    /// gets a new epoch.
    pub async fn refine_shard_key(&self, ctx: &OperationContext, ns: &Namespace, refined: ShardKeyPattern) -> Result<ChunkVersion> {
        let lock = self.locks.lock(&ns.lock_name(), "refineCollectionShardKey", None).await?;
        let result = self.refine_locked(ctx, ns, refined).await;
        release(lock).await;
        result
    }

    async fn refine_locked(&self, ctx: &OperationContext, ns: &Namespace, refined: ShardKeyPattern) -> Result<ChunkVersion> {
        let _op = self.chunk_op_lock.lock().await;
        let (entry, map) = self.authoritative_map(ns).await?;
        entry.key_pattern.validate_refinement(&refined)?;
        let len = refined.len();
        let epoch = Epoch::generate();
        let chunks = map
            .chunks()
            .map(|c| {
                let mut c = c.clone();
                c.range = refine_range(&c.range, len)?;
                c.version = c.version.with_epoch(epoch);
                Ok(c)
            })
            .collect::<Result<Vec<_>>>()?;
        let tags = self
            .catalog()
            .list_tags(ns)
            .await?
            .into_iter()
            .map(|t| {
                Ok(TagRange {
                    range: refine_range(&t.range, len)?,
                    ..t
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let version = map.collection_version().with_epoch(epoch);
        let owners = map.all_shard_ids();
        self.catalog()
            .replace_collection(
                CollectionEntry {
                    epoch,
                    key_pattern: refined.clone(),
                    updated_at: self.clock.tick(),
                    ..entry
                },
                chunks,
                tags,
            )
            .await?;
        self.router.routing().purge(ns);
        self.flush_shards(ctx, ns, owners).await;
        info!(%ns, key = %refined, %version, "shard key refined");
        Ok(version)
    }

    // ---- chunks ----

    /// Split the chunk containing `key` at `points`, which must lie strictly
    /// inside it.
    pub async fn split_chunk(&self, ctx: &OperationContext, ns: &Namespace, key: &ShardKey, points: Vec<ShardKey>) -> Result<ChunkVersion> {
        let lock = self.locks.lock(&ns.lock_name(), "splitChunk", None).await?;
        let result = async {
            let (_, map) = self.authoritative_map(ns).await?;
            let chunk = map.find_intersecting_chunk(key)?.clone();
            self.split_at(ctx, ns, &chunk, map.collection_version(), points).await
        }
        .await;
        release(lock).await;
        result
    }

    /// Caller holds the namespace lock.

    async fn split_at(
        &self,
        ctx: &OperationContext,
        ns: &Namespace,
        chunk: &Chunk,
        expected: ChunkVersion,
        mut points: Vec<ShardKey>,
    ) -> Result<ChunkVersion> {
        points.sort();
        points.dedup();
        if points.is_empty() {
            return Err(ShardgateError::BadValue("no split points given".to_string()));
        }
        if let Some(bad) = points
            .iter()
            .find(|p| p.len() != chunk.min().len() || *p <= chunk.min() || *p >= chunk.max())
        {
            return Err(ShardgateError::BadValue(format!(
                "split point {bad} is not strictly inside {}",
                chunk.range
            )));
        }
        self.send(
            ctx,
            &chunk.shard,
            ns,
            ShardCommand::SplitChunk {
                range: chunk.range.clone(),
                split_points: points.clone(),
                expected,
            },
        )
        .await?;

        let _op = self.chunk_op_lock.lock().await;
        let bounds: Vec<ShardKey> = std::iter::once(chunk.min().clone())
            .chain(points)
            .chain(std::iter::once(chunk.max().clone()))
            .collect();
        let mut version = expected.inc_major();
        let mut pieces = Vec::with_capacity(bounds.len() - 1);
        for w in bounds.windows(2) {
            pieces.push(chunk.with_range(KeyRange::new(w[0].clone(), w[1].clone())?, version));
            version = version.inc_minor();
        }
        let last = pieces.last().map(|c| c.version).unwrap_or(expected);
        let n = pieces.len();
        self.catalog()
            .commit_chunk_changes(ns, expected, vec![chunk.min().clone()], pieces)
            .await?;
        drop(_op);
        info!(%ns, range = %chunk.range, pieces = n, version = %last, "chunk split");
        self.after_commit(ctx, ns, last, BTreeSet::from([chunk.shard.clone()])).await;
        Ok(last)
    }

    /// Merge the contiguous chunks exactly covering `[min, max)`, which must
    /// all live on one shard.
    pub async fn merge_chunks(&self, ctx: &OperationContext, ns: &Namespace, min: ShardKey, max: ShardKey) -> Result<ChunkVersion> {
        let range = KeyRange::new(min, max)?;
        let lock = self.locks.lock(&ns.lock_name(), "mergeChunks", None).await?;
        let result = self.merge_chunks_locked(ctx, ns, range).await;
        release(lock).await;
        result
    }

    async fn merge_chunks_locked(&self, ctx: &OperationContext, ns: &Namespace, range: KeyRange) -> Result<ChunkVersion> {
        let _op = self.chunk_op_lock.lock().await;
        let (_, map) = self.authoritative_map(ns).await?;
        let chunks: Vec<Chunk> = map
            .chunks_for_range(&range.min, &range.max)
            .into_iter()
            .cloned()
            .collect();
        let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
            return Err(ShardgateError::BadValue(format!("no chunks in {range}")));
        };
        if chunks.len() < 2 || first.min() != &range.min || last.max() != &range.max {
            return Err(ShardgateError::IllegalOperation(format!(
                "{range} does not span at least two whole chunks"
            )));
        }
        if chunks.iter().any(|c| c.shard != first.shard) {
            return Err(ShardgateError::IllegalOperation(format!(
                "chunks in {range} live on more than one shard"
            )));
        }
        let expected = map.collection_version();
        let version = expected.inc_minor();
        let owner = first.shard.clone();
        let merged = first.with_range(range.clone(), version);
        let remove = chunks.iter().map(|c| c.min().clone()).collect();
        self.catalog()
            .commit_chunk_changes(ns, expected, remove, vec![merged])
            .await?;
        drop(_op);
        info!(%ns, %range, merged = chunks.len(), %version, "chunks merged");
        self.after_commit(ctx, ns, version, BTreeSet::from([owner])).await;
        Ok(version)
    }

    /// Ask the owner of the chunk containing `key` for split points and
    /// split there. A chunk that is too big but cannot be split is flagged
    /// jumbo.
    pub async fn auto_split(&self, ctx: &OperationContext, ns: &Namespace, key: &ShardKey) -> Result<AutoSplitOutcome> {
        let lock = self.locks.lock(&ns.lock_name(), "autoSplit", None).await?;
        let result = self.auto_split_locked(ctx, ns, key).await;
        release(lock).await;
        result
    }

    async fn auto_split_locked(&self, ctx: &OperationContext, ns: &Namespace, key: &ShardKey) -> Result<AutoSplitOutcome> {
        let (entry, map) = self.authoritative_map(ns).await?;
        let chunk = map.find_intersecting_chunk(key)?.clone();
        if chunk.jumbo {
            return Ok(AutoSplitOutcome::Jumbo);
        }
        let expected = map.collection_version();
        let reply = self
            .send(
                ctx,
                &chunk.shard,
                ns,
                ShardCommand::SplitVector {
                    range: chunk.range.clone(),
                    key_pattern: entry.key_pattern.clone(),
                    max_chunk_size_bytes: self.params().max_chunk_size_bytes,
                },
            )
            .await;
        match reply {
            Ok(ShardResponse::SplitPoints(points)) if points.is_empty() => Ok(AutoSplitOutcome::NotNeeded),
            Ok(ShardResponse::SplitPoints(points)) => {
                let pieces = points.len() + 1;
                let version = self.split_at(ctx, ns, &chunk, expected, points).await?;
                Ok(AutoSplitOutcome::Split { pieces, version })
            }
            Ok(other) => Err(unexpected("splitVector", other)),
            Err(ShardgateError::ChunkTooBig(reason)) => {
                let _op = self.chunk_op_lock.lock().await;
                let mut jumbo = chunk.clone();
                jumbo.jumbo = true;
                jumbo.version = expected.inc_minor();
                self.catalog()
                    .commit_chunk_changes(ns, expected, Vec::new(), vec![jumbo])
                    .await?;
                drop(_op);
                warn!(%ns, range = %chunk.range, %reason, "chunk flagged jumbo");
                self.router.routing().on_stale_config(ns, Some(expected.inc_minor()), None);
                Ok(AutoSplitOutcome::Jumbo)
            }
            Err(e) => Err(e),
        }
    }

    // ---- migrations ----

    /// Move the chunk containing `key` to `to`. The donor keeps serving the
    /// range while its documents are copied, then blocks writes for the
    /// final hand-over and the catalog commit. Any failure before the commit
    /// leaves ownership unchanged and cleans up the recipient.
    pub async fn move_chunk(
        &self,
        ctx: &OperationContext,
        ns: &Namespace,
        key: &ShardKey,
        to: &ShardId,
        options: MoveChunkOptions,
    ) -> Result<MigrationOutcome> {
        let lock = self.locks.lock(&ns.lock_name(), "moveChunk", None).await?;
        let result = self.move_chunk_locked(ctx, ns, key, to, options).await;
        release(lock).await;
        result
    }

    async fn move_chunk_locked(
        &self,
        ctx: &OperationContext,
        ns: &Namespace,
        key: &ShardKey,
        to: &ShardId,
        options: MoveChunkOptions,
    ) -> Result<MigrationOutcome> {
        let recipient = self
            .catalog()
            .list_shards()
            .await?
            .into_iter()
            .find(|s| &s.id == to)
            .ok_or_else(|| ShardgateError::ShardNotFound(to.to_string()))?;
        if recipient.draining {
            return Err(ShardgateError::IllegalOperation(format!("shard {to} is draining")));
        }
        let (entry, map) = self.authoritative_map(ns).await?;
        let chunk = map.find_intersecting_chunk(key)?.clone();
        if &chunk.shard == to {
            return Ok(MigrationOutcome {
                ns: ns.clone(),
                range: chunk.range,
                from: to.clone(),
                to: to.clone(),
                version: map.collection_version(),
                cloned: 0,
            });
        }
        if chunk.jumbo && !options.force_jumbo {
            return Err(ShardgateError::ChunkTooBig(format!(
                "chunk {} of {ns} is jumbo",
                chunk.range
            )));
        }

        let doc = MigrationDocument {
            id: Uuid::new_v4(),
            ns: ns.clone(),
            collection_uuid: entry.uuid,
            range: chunk.range.clone(),
            from: chunk.shard.clone(),
            to: to.clone(),
            expected_version: map.collection_version(),
            state: MigrationState::Cloning,
            started_at: self.clock.tick(),
        };
        self.catalog().put_migration(doc.clone()).await?;
        info!(%ns, range = %doc.range, from = %doc.from, %to, migration = %doc.id, "migration started");

        let (version, cloned) = match self.clone_and_commit(ctx, &doc).await {
            Ok(done) => done,
            Err(e) => {
                warn!(%ns, range = %doc.range, migration = %doc.id, error = %e, "migration aborted");
                self.abort_migration(&doc).await;
                return Err(e);
            }
        };
        self.catalog()
            .put_migration(MigrationDocument {
                state: MigrationState::Committed,
                ..doc.clone()
            })
            .await?;
        self.finish_committed(&doc, Some(version), options.wait_for_delete).await?;
        info!(%ns, range = %doc.range, from = %doc.from, %to, %version, cloned, "migration committed");
        Ok(MigrationOutcome {
            ns: ns.clone(),
            range: doc.range,
            from: doc.from,
            to: doc.to,
            version,
            cloned,
        })
    }

    async fn recv(&self, ctx: &OperationContext, doc: &MigrationDocument, documents: Vec<Value>) -> Result<u64> {
        match self
            .send(
                ctx,
                &doc.to,
                &doc.ns,
                ShardCommand::RecvChunk {
                    migration_id: doc.id,
                    documents,
                },
            )
            .await?
        {
            ShardResponse::Inserted { n } => Ok(n),
            other => Err(unexpected("recvChunk", other)),
        }
    }

    async fn clone_and_commit(&self, ctx: &OperationContext, doc: &MigrationDocument) -> Result<(ChunkVersion, u64)> {
        let ns = &doc.ns;
        self.send(
            ctx,
            &doc.from,
            ns,
            ShardCommand::MoveChunk {
                migration_id: doc.id,
                range: doc.range.clone(),
                to: doc.to.clone(),
            },
        )
        .await?;

        let mut offset = 0;
        let mut cloned = 0;
        loop {
            ctx.check_for_interrupt()?;
            let command = ShardCommand::CloneBatch {
                migration_id: doc.id,
                offset,
                batch_size: self.params().migration_batch_size,
            };
            let (docs, done) = match self.send(ctx, &doc.from, ns, command).await? {
                ShardResponse::Documents { docs, done } => (docs, done),
                other => return Err(unexpected("cloneBatch", other)),
            };
            offset += docs.len();
            if !docs.is_empty() {
                cloned += self.recv(ctx, doc, docs).await?;
            }
            if done {
                break;
            }
        }
        debug!(%ns, migration = %doc.id, cloned, "initial clone finished");

        let mods = match self
            .send(ctx, &doc.from, ns, ShardCommand::EnterCriticalSection { migration_id: doc.id })
            .await?
        {
            ShardResponse::Documents { docs, .. } => docs,
            other => return Err(unexpected("enterCriticalSection", other)),
        };
        if !mods.is_empty() {
            self.recv(ctx, doc, mods).await?;
        }
        let version = self.commit_migration(doc).await?;
        Ok((version, cloned))
    }

    /// Hand the range to the recipient at a new major version and bump one
    /// chunk the donor keeps, so both shards' versions advance.
    async fn commit_migration(&self, doc: &MigrationDocument) -> Result<ChunkVersion> {
        let _op = self.chunk_op_lock.lock().await;
        let (_, map) = self.authoritative_map(&doc.ns).await?;
        let current = map.collection_version();
        let chunk = map.find_intersecting_chunk(&doc.range.min)?;
        if map.uuid() != doc.collection_uuid || chunk.range != doc.range || chunk.shard != doc.from {
            return Err(ShardgateError::ConflictingOperationInProgress(format!(
                "chunk {} of {} changed during the migration",
                doc.range, doc.ns
            )));
        }
        let major = current.inc_major();
        let mut version = major;
        let mut upsert = vec![chunk.with_new_owner(
            doc.to.clone(),
            major,
            self.clock.tick(),
            self.params().chunk_history_secs,
        )];
        if let Some(control) = map.chunks_on_shard(&doc.from).find(|c| c.range != doc.range) {
            let mut control = control.clone();
            version = major.inc_minor();
            control.version = version;
            upsert.push(control);
        }
        self.catalog()
            .commit_chunk_changes(&doc.ns, current, Vec::new(), upsert)
            .await?;
        Ok(version)
    }

    /// Everything after the catalog commit: release the donor's critical
    /// section, refresh both shards, and queue the donor's orphans for
    /// deletion.
    async fn finish_committed(&self, doc: &MigrationDocument, version: Option<ChunkVersion>, wait_for_delete: bool) -> Result<()> {
        let ctx = self.cleanup_ctx();
        if let Err(e) = self
            .send(&ctx, &doc.from, &doc.ns, ShardCommand::CommitMigration { migration_id: doc.id })
            .await
        {
            warn!(ns = %doc.ns, shard = %doc.from, error = %e, "donor did not leave its critical section");
        }
        self.router.routing().on_stale_config(&doc.ns, version, None);
        self.flush_shards(&ctx, &doc.ns, BTreeSet::from([doc.from.clone(), doc.to.clone()]))
            .await;

        let task = RangeDeletionTask {
            id: Uuid::new_v4(),
            ns: doc.ns.clone(),
            collection_uuid: doc.collection_uuid,
            range: doc.range.clone(),
            shard: doc.from.clone(),
            attempts: 0,
        };
        self.catalog().put_range_deletion(task.clone()).await?;
        self.catalog().remove_migration(doc.id).await?;
        if wait_for_delete {
            if let Err(e) = self.range_deleter.run_task(&ctx, task).await {
                warn!(ns = %doc.ns, range = %doc.range, error = %e, "range deletion deferred to the background");
            }
        }
        Ok(())
    }

    /// Undo an uncommitted migration. Best effort: a recipient that cannot
    /// be reached gets a deletion task instead.
    async fn abort_migration(&self, doc: &MigrationDocument) {
        let ctx = self.cleanup_ctx();
        if let Err(e) = self
            .send(&ctx, &doc.from, &doc.ns, ShardCommand::AbortMigration { migration_id: doc.id })
            .await
        {
            warn!(ns = %doc.ns, shard = %doc.from, error = %e, "donor did not abort the migration");
        }
        let cleaned = self
            .send(&ctx, &doc.to, &doc.ns, ShardCommand::DeleteRange { range: doc.range.clone() })
            .await;
        if let Err(e) = cleaned {
            warn!(ns = %doc.ns, shard = %doc.to, error = %e, "recipient cleanup deferred");
            let task = RangeDeletionTask {
                id: Uuid::new_v4(),
                ns: doc.ns.clone(),
                collection_uuid: doc.collection_uuid,
                range: doc.range.clone(),
                shard: doc.to.clone(),
                attempts: 0,
            };
            if let Err(e) = self.catalog().put_range_deletion(task).await {
                warn!(ns = %doc.ns, error = %e, "could not record recipient cleanup");
            }
        }
        if let Err(e) = self.catalog().remove_migration(doc.id).await {
            warn!(migration = %doc.id, error = %e, "could not remove migration record");
        }
    }

    /// Finish or roll back migrations a previous coordinator left behind,
    /// deciding from the catalog alone: a range the catalog already gives to
    /// the recipient is completed, anything else is aborted.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for doc in self.catalog().list_migrations().await? {
            let lock = self.locks.lock(&doc.ns.lock_name(), "recoverMigration", None).await?;
            let result = self.recover_one(&doc).await;
            release(lock).await;
            if result? {
                report.completed.push(doc.id);
            } else {
                report.aborted.push(doc.id);
            }
        }
        if !report.completed.is_empty() || !report.aborted.is_empty() {
            info!(completed = report.completed.len(), aborted = report.aborted.len(), "interrupted migrations recovered");
        }
        Ok(report)
    }

    async fn recover_one(&self, doc: &MigrationDocument) -> Result<bool> {
        let committed = match doc.state {
            MigrationState::Committed => true,
            MigrationState::Cloning => match self.authoritative_map(&doc.ns).await {
                Ok((entry, map)) => {
                    entry.uuid == doc.collection_uuid
                        && map
                            .find_intersecting_chunk(&doc.range.min)
                            .map(|c| c.range == doc.range && c.shard == doc.to)
                            .unwrap_or(false)
                }
                Err(ShardgateError::NamespaceNotFound(_)) => false,
                Err(e) => return Err(e),
            },
        };
        if committed {
            self.finish_committed(doc, None, false).await?;
        } else {
            self.abort_migration(doc).await;
        }
        Ok(committed)
    }

    // ---- shards ----

    /// Register a new shard after checking that it answers as `id`.
    pub async fn add_shard(
        &self,
        ctx: &OperationContext,
        id: ShardId,
        connection_string: ConnectionString,
        max_size_bytes: u64,
    ) -> Result<ShardEntry> {
        let deadline = ctx.deadline_or(self.params().default_op_timeout);
        let mut last_error = ShardgateError::HostUnreachable(connection_string.to_string());
        let mut confirmed = false;
        for host in connection_string.hosts() {
            let hello = ShardRequest::new(Namespace::new("admin", "$cmd"), ShardCommand::Hello);
            match self.router.client().send_to_host(host, hello, deadline).await {
                Ok(ShardResponse::Hello { shard, .. }) if shard == id => {
                    confirmed = true;
                    break;
                }
                Ok(ShardResponse::Hello { shard, .. }) => {
                    return Err(ShardgateError::BadValue(format!(
                        "{host} identifies as shard {shard}, not {id}"
                    )))
                }
                Ok(other) => last_error = unexpected("hello", other),
                Err(e) => last_error = e,
            }
        }
        if !confirmed {
            return Err(last_error);
        }
        let entry = ShardEntry {
            id,
            connection_string,
            max_size_bytes,
            draining: false,
        };
        self.catalog().add_shard(entry.clone()).await?;
        self.router.reload_shards().await?;
        info!(shard = %entry.id, conn = %entry.connection_string, "shard added");
        Ok(entry)
    }

    async fn shard_usage(&self, id: &ShardId) -> Result<(usize, Vec<String>)> {
        let mut chunks = 0;
        for coll in self.catalog().list_collections(None).await? {
            if coll.dropped {
                continue;
            }
            chunks += self
                .catalog()
                .get_chunks(&coll.ns, None)
                .await?
                .iter()
                .filter(|c| &c.shard == id)
                .count();
        }
        let mut databases: Vec<String> = self
            .catalog()
            .list_databases()
            .await?
            .into_iter()
            .filter(|d| &d.primary == id)
            .map(|d| d.name)
            .collect();
        databases.sort();
        Ok((chunks, databases))
    }

    /// Drain and then remove a shard. The first call marks it draining so
    /// the balancer moves its chunks away; later calls report progress and
    /// remove it once it owns no chunks and is no database's primary.
    pub async fn remove_shard(&self, id: &ShardId) -> Result<RemoveShardStatus> {
        let shards = self.catalog().list_shards().await?;
        let mut entry = shards
            .iter()
            .find(|s| &s.id == id)
            .cloned()
            .ok_or_else(|| ShardgateError::ShardNotFound(id.to_string()))?;
        if !shards.iter().any(|s| &s.id != id && !s.draining) {
            return Err(ShardgateError::IllegalOperation(format!(
                "cannot remove {id}, the last shard"
            )));
        }
        let (chunks, databases) = self.shard_usage(id).await?;
        if !entry.draining {
            entry.draining = true;
            self.catalog().update_shard(entry).await?;
            self.router.reload_shards().await?;
            info!(shard = %id, chunks, "shard draining started");
            return Ok(RemoveShardStatus::Started { chunks, databases });
        }
        if chunks > 0 || !databases.is_empty() {
            return Ok(RemoveShardStatus::Ongoing { chunks, databases });
        }
        self.catalog().remove_shard(id).await?;
        self.router.reload_shards().await?;
        info!(shard = %id, "shard removed");
        Ok(RemoveShardStatus::Completed)
    }

    // ---- zones ----

    pub async fn assign_zone_range(&self, ns: &Namespace, range: KeyRange, zone: &str) -> Result<()> {
        if zone.is_empty() {
            return Err(ShardgateError::BadValue("zone name must not be empty".to_string()));
        }
        self.catalog()
            .add_tag(TagRange {
                ns: ns.clone(),
                range,
                zone: zone.to_string(),
            })
            .await
    }

    pub async fn remove_zone_range(&self, ns: &Namespace, min: &ShardKey) -> Result<()> {
        self.catalog().remove_tag(ns, min).await
    }
}
