use crate::catalog::{
    CatalogClient, CollectionEntry, DatabaseEntry, LockDocument, MigrationDocument, RangeDeletionTask, ShardEntry,
    TagRange,
};
use crate::chunk::Chunk;
use crate::chunk_map::ChunkMap;
use crate::clock::ClusterClock;
use crate::error::{Result, ShardgateError};
use crate::journal::{CatalogRecord, Journal};
use crate::key::ShardKey;
use crate::namespace::{Namespace, ShardId};
use crate::version::{ChunkVersion, Epoch};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct CatalogState {
    databases: BTreeMap<String, DatabaseEntry>,
    collections: BTreeMap<Namespace, CollectionEntry>,
    /// Chunks per collection keyed by their min bound.
    chunks: HashMap<Namespace, BTreeMap<ShardKey, Chunk>>,
    shards: BTreeMap<ShardId, ShardEntry>,
    tags: HashMap<Namespace, BTreeMap<ShardKey, TagRange>>,
    locks: HashMap<String, LockDocument>,
    migrations: HashMap<Uuid, MigrationDocument>,
    range_deletions: HashMap<Uuid, RangeDeletionTask>,
}

impl CatalogState {
    /// The only way state changes, shared by live writes and journal replay.
    fn apply(&mut self, record: CatalogRecord) {
        match record {
            CatalogRecord::PutDatabase(db) => {
                self.databases.insert(db.name.clone(), db);
            }
            CatalogRecord::PutCollection(entry) => {
                self.collections.insert(entry.ns.clone(), entry);
            }
            CatalogRecord::CommitChunks { ns, remove, upsert } => {
                let chunks = self.chunks.entry(ns).or_default();
                for min in remove {
                    chunks.remove(&min);
                }
                for chunk in upsert {
                    chunks.insert(chunk.range.min.clone(), chunk);
                }
            }
            CatalogRecord::ReplaceCollection { entry, chunks, tags } => {
                let ns = entry.ns.clone();
                self.collections.insert(ns.clone(), entry);
                self.chunks.insert(
                    ns.clone(),
                    chunks.into_iter().map(|c| (c.range.min.clone(), c)).collect(),
                );
                self.tags.insert(
                    ns,
                    tags.into_iter().map(|t| (t.range.min.clone(), t)).collect(),
                );
            }
            CatalogRecord::DropCollection { ns, at } => {
                if let Some(entry) = self.collections.get_mut(&ns) {
                    entry.dropped = true;
                    entry.updated_at = at;
                }
                self.chunks.remove(&ns);
                self.tags.remove(&ns);
            }
            CatalogRecord::RenameCollection { from, to, epoch, at } => {
                let Some(mut entry) = self.collections.get(&from).cloned() else {
                    return;
                };
                let chunks = self.chunks.remove(&from).unwrap_or_default();
                let tags = self.tags.remove(&from).unwrap_or_default();
                if let Some(old) = self.collections.get_mut(&from) {
                    old.dropped = true;
                    old.updated_at = at;
                }
                entry.ns = to.clone();
                entry.epoch = epoch;
                entry.updated_at = at;
                entry.dropped = false;
                self.collections.insert(to.clone(), entry);
                self.chunks.insert(
                    to.clone(),
                    chunks
                        .into_iter()
                        .map(|(min, mut c)| {
                            c.version = c.version.with_epoch(epoch);
                            (min, c)
                        })
                        .collect(),
                );
                self.tags.insert(
                    to.clone(),
                    tags.into_iter()
                        .map(|(min, mut t)| {
                            t.ns = to.clone();
                            (min, t)
                        })
                        .collect(),
                );
            }
            CatalogRecord::PutShard(shard) => {
                self.shards.insert(shard.id.clone(), shard);
            }
            CatalogRecord::RemoveShard(id) => {
                self.shards.remove(&id);
            }
            CatalogRecord::PutTag(tag) => {
                self.tags
                    .entry(tag.ns.clone())
                    .or_default()
                    .insert(tag.range.min.clone(), tag);
            }
            CatalogRecord::RemoveTag { ns, min } => {
                if let Some(tags) = self.tags.get_mut(&ns) {
                    tags.remove(&min);
                }
            }
            CatalogRecord::PutLock(lock) => {
                self.locks.insert(lock.name.clone(), lock);
            }
            CatalogRecord::RemoveLock(name) => {
                self.locks.remove(&name);
            }
            CatalogRecord::PutMigration(doc) => {
                self.migrations.insert(doc.id, doc);
            }
            CatalogRecord::RemoveMigration(id) => {
                self.migrations.remove(&id);
            }
            CatalogRecord::PutRangeDeletion(task) => {
                self.range_deletions.insert(task.id, task);
            }
            CatalogRecord::RemoveRangeDeletion(id) => {
                self.range_deletions.remove(&id);
            }
        }
    }

    fn live_collection(&self, ns: &Namespace) -> Result<&CollectionEntry> {
        self.collections
            .get(ns)
            .filter(|c| !c.dropped)
            .ok_or_else(|| ShardgateError::NamespaceNotFound(ns.to_string()))
    }

    fn collection_version(&self, ns: &Namespace, epoch: Epoch) -> ChunkVersion {
        self.chunks
            .get(ns)
            .into_iter()
            .flat_map(|c| c.values())
            .map(|c| c.version)
            .fold(ChunkVersion::zero(epoch), |acc, v| if acc.is_older_than(&v) { v } else { acc })
    }

    /// Records that recreate this state from nothing.
    fn snapshot_records(&self) -> Vec<CatalogRecord> {
        let mut out = Vec::new();
        out.extend(self.shards.values().cloned().map(CatalogRecord::PutShard));
        out.extend(self.databases.values().cloned().map(CatalogRecord::PutDatabase));
        for entry in self.collections.values() {
            if entry.dropped {
                out.push(CatalogRecord::PutCollection(entry.clone()));
                continue;
            }
            out.push(CatalogRecord::ReplaceCollection {
                entry: entry.clone(),
                chunks: self
                    .chunks
                    .get(&entry.ns)
                    .map(|c| c.values().cloned().collect())
                    .unwrap_or_default(),
                tags: self
                    .tags
                    .get(&entry.ns)
                    .map(|t| t.values().cloned().collect())
                    .unwrap_or_default(),
            });
        }
        out.extend(self.locks.values().cloned().map(CatalogRecord::PutLock));
        out.extend(self.migrations.values().cloned().map(CatalogRecord::PutMigration));
        out.extend(
            self.range_deletions
                .values()
                .cloned()
                .map(CatalogRecord::PutRangeDeletion),
        );
        out
    }
}

/// In-process catalog, optionally made durable by a journal.
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    journal: Option<Mutex<Journal>>,
    clock: Arc<ClusterClock>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            journal: None,
            clock: Arc::new(ClusterClock::new()),
        }
    }

    /// Open a journal in `dir` and replay it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let journal = Journal::open(dir)?;
        let mut state = CatalogState::default();
        let records = journal.replay()?;
        let replayed = records.len();
        for record in records {
            state.apply(record);
        }
        info!(records = replayed, "catalog journal replayed");
        Ok(Self {
            state: RwLock::new(state),
            journal: Some(Mutex::new(journal)),
            clock: Arc::new(ClusterClock::new()),
        })
    }

    /// Rewrite the journal as a snapshot of the current state.
    pub fn compact(&self) -> Result<()> {
        let state = self.state.read();
        if let Some(journal) = &self.journal {
            journal.lock().rewrite(&state.snapshot_records())?;
        }
        Ok(())
    }

    /// Journal then apply, under the state lock so both see the same order.
    fn commit(&self, state: &mut CatalogState, record: CatalogRecord) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.lock().append(&record)?;
        }
        state.apply(record);
        Ok(())
    }

    fn write(&self, record: CatalogRecord) -> Result<()> {
        let mut state = self.state.write();
        self.commit(&mut state, record)
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn get_database(&self, name: &str) -> Result<DatabaseEntry> {
        self.state
            .read()
            .databases
            .get(name)
            .cloned()
            .ok_or_else(|| ShardgateError::NamespaceNotFound(name.to_string()))
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseEntry>> {
        Ok(self.state.read().databases.values().cloned().collect())
    }

    async fn upsert_database(&self, entry: DatabaseEntry) -> Result<()> {
        let mut state = self.state.write();
        if !state.shards.contains_key(&entry.primary) {
            return Err(ShardgateError::ShardNotFound(entry.primary.to_string()));
        }
        self.commit(&mut state, CatalogRecord::PutDatabase(entry))
    }

    async fn get_collection(&self, ns: &Namespace) -> Result<Option<CollectionEntry>> {
        Ok(self.state.read().collections.get(ns).cloned())
    }

    async fn list_collections(&self, db: Option<&str>) -> Result<Vec<CollectionEntry>> {
        Ok(self
            .state
            .read()
            .collections
            .values()
            .filter(|c| !c.dropped && db.map(|d| c.ns.db == d).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_chunks(&self, ns: &Namespace, since: Option<ChunkVersion>) -> Result<Vec<Chunk>> {
        let state = self.state.read();
        let Some(chunks) = state.chunks.get(ns) else {
            return Ok(Vec::new());
        };
        Ok(chunks
            .values()
            .filter(|c| match since {
                Some(v) if v.same_epoch(&c.version) => !c.version.is_older_than(&v),
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn commit_chunk_changes(
        &self,
        ns: &Namespace,
        expected: ChunkVersion,
        remove: Vec<ShardKey>,
        upsert: Vec<Chunk>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let entry = state.live_collection(ns)?.clone();
        let current = state.collection_version(ns, entry.epoch);
        if !expected.same_epoch(&current) {
            return Err(ShardgateError::StaleEpoch {
                ns: ns.clone(),
                received: expected,
                wanted: Some(current),
            });
        }
        if expected != current {
            return Err(ShardgateError::ConflictingOperationInProgress(format!(
                "collection version of {ns} is {current}, expected {expected}"
            )));
        }

        // Validate the result before making it visible.
        let mut trial = state.chunks.get(ns).cloned().unwrap_or_default();
        for min in &remove {
            trial.remove(min);
        }
        for chunk in &upsert {
            trial.insert(chunk.range.min.clone(), chunk.clone());
        }
        let map = ChunkMap::build(entry.metadata(), trial.into_values().collect())?;
        if !upsert.is_empty() && !current.is_older_than(&map.collection_version()) {
            return Err(ShardgateError::InconsistentChunkMap(format!(
                "commit on {ns} does not advance the collection version past {current}"
            )));
        }

        self.commit(
            &mut state,
            CatalogRecord::CommitChunks {
                ns: ns.clone(),
                remove,
                upsert,
            },
        )
    }

    async fn replace_collection(
        &self,
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
        tags: Vec<TagRange>,
    ) -> Result<()> {
        ChunkMap::build(entry.metadata(), chunks.clone())?;
        let mut state = self.state.write();
        if !state.databases.contains_key(&entry.ns.db) {
            return Err(ShardgateError::NamespaceNotFound(entry.ns.db.clone()));
        }
        self.commit(&mut state, CatalogRecord::ReplaceCollection { entry, chunks, tags })
    }

    async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        let at = self.clock.tick();
        let mut state = self.state.write();
        if state.collections.get(ns).map(|c| c.dropped).unwrap_or(true) {
            return Ok(());
        }
        self.commit(&mut state, CatalogRecord::DropCollection { ns: ns.clone(), at })
    }

    async fn rename_collection(&self, from: &Namespace, to: &Namespace, epoch: Epoch) -> Result<()> {
        let at = self.clock.tick();
        let mut state = self.state.write();
        state.live_collection(from)?;
        if state.live_collection(to).is_ok() {
            return Err(ShardgateError::IllegalOperation(format!(
                "target namespace {to} is already sharded"
            )));
        }
        self.commit(
            &mut state,
            CatalogRecord::RenameCollection {
                from: from.clone(),
                to: to.clone(),
                epoch,
                at,
            },
        )
    }

    async fn list_shards(&self) -> Result<Vec<ShardEntry>> {
        Ok(self.state.read().shards.values().cloned().collect())
    }

    async fn add_shard(&self, entry: ShardEntry) -> Result<()> {
        let mut state = self.state.write();
        if state.shards.contains_key(&entry.id) || entry.id.is_config() {
            return Err(ShardgateError::IllegalOperation(format!(
                "shard {} already exists",
                entry.id
            )));
        }
        self.commit(&mut state, CatalogRecord::PutShard(entry))
    }

    async fn update_shard(&self, entry: ShardEntry) -> Result<()> {
        let mut state = self.state.write();
        if !state.shards.contains_key(&entry.id) {
            return Err(ShardgateError::ShardNotFound(entry.id.to_string()));
        }
        self.commit(&mut state, CatalogRecord::PutShard(entry))
    }

    async fn remove_shard(&self, id: &ShardId) -> Result<()> {
        let mut state = self.state.write();
        if !state.shards.contains_key(id) {
            return Err(ShardgateError::ShardNotFound(id.to_string()));
        }
        let owns_chunks = state
            .chunks
            .values()
            .any(|chunks| chunks.values().any(|c| &c.shard == id));
        let is_primary = state.databases.values().any(|d| &d.primary == id);
        if owns_chunks || is_primary {
            return Err(ShardgateError::IllegalOperation(format!(
                "shard {id} still owns data"
            )));
        }
        self.commit(&mut state, CatalogRecord::RemoveShard(id.clone()))
    }

    async fn list_tags(&self, ns: &Namespace) -> Result<Vec<TagRange>> {
        Ok(self
            .state
            .read()
            .tags
            .get(ns)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_tag(&self, tag: TagRange) -> Result<()> {
        let mut state = self.state.write();
        let entry = state.live_collection(&tag.ns)?;
        if !entry.key_pattern.is_valid_key(&tag.range.min) || !entry.key_pattern.is_valid_key(&tag.range.max) {
            return Err(ShardgateError::BadValue(format!(
                "zone range {} does not match shard key {}",
                tag.range, entry.key_pattern
            )));
        }
        if let Some(clash) = state
            .tags
            .get(&tag.ns)
            .and_then(|t| t.values().find(|t| t.range.overlaps(&tag.range)))
        {
            return Err(ShardgateError::BadValue(format!(
                "zone range {} overlaps {} of zone {}",
                tag.range, clash.range, clash.zone
            )));
        }
        self.commit(&mut state, CatalogRecord::PutTag(tag))
    }

    async fn remove_tag(&self, ns: &Namespace, min: &ShardKey) -> Result<()> {
        self.write(CatalogRecord::RemoveTag {
            ns: ns.clone(),
            min: min.clone(),
        })
    }

    async fn try_lock(&self, doc: LockDocument, now_ms: u64) -> Result<std::result::Result<(), LockDocument>> {
        let mut state = self.state.write();
        if let Some(held) = state.locks.get(&doc.name) {
            if held.lock_id != doc.lock_id && !held.expired(now_ms) {
                return Ok(Err(held.clone()));
            }
            if held.lock_id != doc.lock_id {
                warn!(lock = %doc.name, previous = %held.holder, holder = %doc.holder, "overtaking expired lock");
            }
        }
        let doc = LockDocument {
            lease_at_ms: now_ms,
            ..doc
        };
        self.commit(&mut state, CatalogRecord::PutLock(doc))?;
        Ok(Ok(()))
    }

    async fn renew_lock(&self, name: &str, lock_id: Uuid, now_ms: u64) -> Result<bool> {
        let mut state = self.state.write();
        let Some(held) = state.locks.get(name).filter(|l| l.lock_id == lock_id).cloned() else {
            return Ok(false);
        };
        self.commit(
            &mut state,
            CatalogRecord::PutLock(LockDocument {
                lease_at_ms: now_ms,
                ..held
            }),
        )?;
        Ok(true)
    }

    async fn unlock(&self, name: &str, lock_id: Uuid) -> Result<()> {
        let mut state = self.state.write();
        if state.locks.get(name).map(|l| l.lock_id == lock_id).unwrap_or(false) {
            self.commit(&mut state, CatalogRecord::RemoveLock(name.to_string()))?;
        }
        Ok(())
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockDocument>> {
        Ok(self.state.read().locks.get(name).cloned())
    }

    async fn put_migration(&self, doc: MigrationDocument) -> Result<()> {
        self.write(CatalogRecord::PutMigration(doc))
    }

    async fn remove_migration(&self, id: Uuid) -> Result<()> {
        self.write(CatalogRecord::RemoveMigration(id))
    }

    async fn list_migrations(&self) -> Result<Vec<MigrationDocument>> {
        Ok(self.state.read().migrations.values().cloned().collect())
    }

    async fn put_range_deletion(&self, task: RangeDeletionTask) -> Result<()> {
        self.write(CatalogRecord::PutRangeDeletion(task))
    }

    async fn remove_range_deletion(&self, id: Uuid) -> Result<()> {
        self.write(CatalogRecord::RemoveRangeDeletion(id))
    }

    async fn list_range_deletions(&self) -> Result<Vec<RangeDeletionTask>> {
        Ok(self.state.read().range_deletions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::key::{KeyRange, KeyValue, ShardKeyPattern};
    use crate::query::Collation;
    use crate::registry::ConnectionString;

    fn k(v: i64) -> ShardKey {
        ShardKey::new(vec![KeyValue::Int(v)])
    }

    fn shard(id: &str) -> ShardEntry {
        ShardEntry {
            id: id.into(),
            connection_string: ConnectionString::parse(&format!("{id}:1")).unwrap(),
            max_size_bytes: 0,
            draining: false,
        }
    }

    fn collection(ns: &Namespace, epoch: Epoch) -> CollectionEntry {
        CollectionEntry {
            ns: ns.clone(),
            uuid: Uuid::new_v4(),
            epoch,
            key_pattern: ShardKeyPattern::new(vec!["x"]).unwrap(),
            default_collation: Collation::simple(),
            unique: false,
            dropped: false,
            updated_at: Timestamp::ZERO,
        }
    }

    async fn seeded(catalog: &InMemoryCatalog) -> Result<(Namespace, CollectionEntry, Chunk)> {
        catalog.add_shard(shard("a")).await?;
        catalog
            .upsert_database(DatabaseEntry {
                name: "db".into(),
                primary: "a".into(),
                sharding_enabled: true,
                version: Uuid::new_v4(),
            })
            .await?;
        let ns = Namespace::new("db", "c");
        let entry = collection(&ns, Epoch::generate());
        let chunk = Chunk::new(
            entry.uuid,
            KeyRange::new(ShardKey::global_min(1), ShardKey::global_max(1))?,
            "a".into(),
            ChunkVersion::new(entry.epoch, 1, 0),
            Timestamp::new(1, 0),
        );
        catalog
            .replace_collection(entry.clone(), vec![chunk.clone()], Vec::new())
            .await?;
        Ok((ns, entry, chunk))
    }

    #[tokio::test]
    async fn commits_are_version_guarded_and_validated() -> Result<()> {
        let catalog = InMemoryCatalog::new();
        let (ns, entry, chunk) = seeded(&catalog).await?;
        let v1 = ChunkVersion::new(entry.epoch, 1, 0);
        let left = chunk.with_range(KeyRange::new(ShardKey::global_min(1), k(0))?, ChunkVersion::new(entry.epoch, 2, 0));
        let right = chunk.with_range(KeyRange::new(k(0), ShardKey::global_max(1))?, ChunkVersion::new(entry.epoch, 2, 1));

        // A gap is rejected and nothing changes.
        let bad = catalog
            .commit_chunk_changes(&ns, v1, vec![chunk.range.min.clone()], vec![right.clone()])
            .await;
        assert!(matches!(bad, Err(ShardgateError::InconsistentChunkMap(_))));
        assert_eq!(catalog.get_chunks(&ns, None).await?.len(), 1);

        catalog
            .commit_chunk_changes(&ns, v1, vec![chunk.range.min.clone()], vec![left.clone(), right])
            .await?;
        assert_eq!(catalog.get_chunks(&ns, None).await?.len(), 2);

        // Same expected version again: someone else already committed.
        let again = catalog
            .commit_chunk_changes(&ns, v1, Vec::new(), vec![left])
            .await;
        assert!(matches!(again, Err(ShardgateError::ConflictingOperationInProgress(_))));

        let since = catalog
            .get_chunks(&ns, Some(ChunkVersion::new(entry.epoch, 2, 1)))
            .await?;
        assert_eq!(since.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn locks_respect_live_leases() -> Result<()> {
        let catalog = InMemoryCatalog::new();
        let mine = LockDocument {
            name: "db.c".into(),
            holder: "p1".into(),
            lock_id: Uuid::new_v4(),
            lease_at_ms: 0,
            lease_ms: 100,
            why: "split".into(),
        };
        let theirs = LockDocument {
            holder: "p2".into(),
            lock_id: Uuid::new_v4(),
            ..mine.clone()
        };
        assert!(catalog.try_lock(mine.clone(), 1_000).await?.is_ok());
        assert!(catalog.try_lock(theirs.clone(), 1_050).await?.is_err());
        assert!(catalog.renew_lock("db.c", mine.lock_id, 1_080).await?);
        assert!(catalog.try_lock(theirs.clone(), 1_150).await?.is_err());
        // Lease ran out: overtaken.
        assert!(catalog.try_lock(theirs.clone(), 1_300).await?.is_ok());
        assert!(!catalog.renew_lock("db.c", mine.lock_id, 1_310).await?);
        catalog.unlock("db.c", mine.lock_id).await?;
        assert_eq!(
            catalog.get_lock("db.c").await?.map(|l| l.holder),
            Some("p2".to_string())
        );
        catalog.unlock("db.c", theirs.lock_id).await?;
        assert!(catalog.get_lock("db.c").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn catalog_keeps_writes_made_after_a_torn_tail() -> Result<()> {
        use std::io::Write;

        let dir = tempfile::tempdir()?;
        {
            let catalog = InMemoryCatalog::open(dir.path())?;
            catalog.add_shard(shard("a")).await?;
        }
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("catalog.journal"))?;
        f.write_all(&100u32.to_le_bytes())?;
        f.write_all(&[1, 2, 3])?;
        drop(f);

        {
            let catalog = InMemoryCatalog::open(dir.path())?;
            for id in ["b", "c", "d", "e"] {
                catalog.add_shard(shard(id)).await?;
            }
            assert_eq!(catalog.list_shards().await?.len(), 5);
        }
        let reopened = InMemoryCatalog::open(dir.path())?;
        assert_eq!(reopened.list_shards().await?.len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn journal_survives_reopen_and_compaction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ns;
        {
            let catalog = InMemoryCatalog::open(dir.path())?;
            let seeded = seeded(&catalog).await?;
            ns = seeded.0;
            catalog.drop_collection(&ns).await?;
            catalog.compact()?;
            catalog.add_shard(shard("b")).await?;
        }
        let reopened = InMemoryCatalog::open(dir.path())?;
        assert_eq!(reopened.list_shards().await?.len(), 2);
        let entry = reopened.get_collection(&ns).await?.expect("collection record");
        assert!(entry.dropped);
        assert!(reopened.get_chunks(&ns, None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn shard_with_data_cannot_be_removed() -> Result<()> {
        let catalog = InMemoryCatalog::new();
        seeded(&catalog).await?;
        assert!(matches!(
            catalog.remove_shard(&"a".into()).await,
            Err(ShardgateError::IllegalOperation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rename_moves_chunks_under_a_new_epoch() -> Result<()> {
        let catalog = InMemoryCatalog::new();
        let (ns, entry, _) = seeded(&catalog).await?;
        let to = Namespace::new("db", "renamed");
        let epoch = Epoch::generate();
        catalog.rename_collection(&ns, &to, epoch).await?;
        assert!(catalog.get_collection(&ns).await?.map(|c| c.dropped).unwrap_or(false));
        let moved = catalog.get_chunks(&to, None).await?;
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].version.epoch, epoch);
        assert_ne!(epoch, entry.epoch);
        Ok(())
    }
}
