//! Durable cluster metadata: databases, sharded collections, chunks, shards,
//! zones, distributed locks and in-flight lifecycle work. Records are plain
//! values; `CatalogClient` is the seam between the router and whatever stores
//! them.

use crate::chunk::Chunk;
use crate::chunk_map::CollectionMetadata;
use crate::clock::Timestamp;
use crate::error::{Result, ShardgateError};
use crate::key::{KeyRange, ShardKey, ShardKeyPattern};
use crate::namespace::{Namespace, ShardId};
use crate::query::Collation;
use crate::registry::ConnectionString;
use crate::version::{ChunkVersion, Epoch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub primary: ShardId,
    pub sharding_enabled: bool,
    /// Changes whenever the primary moves, so cached entries can be compared.
    pub version: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub ns: Namespace,
    pub uuid: Uuid,
    pub epoch: Epoch,
    pub key_pattern: ShardKeyPattern,
    pub default_collation: Collation,
    pub unique: bool,
    pub dropped: bool,
    pub updated_at: Timestamp,
}

impl CollectionEntry {
    pub fn metadata(&self) -> CollectionMetadata {
        CollectionMetadata {
            ns: self.ns.clone(),
            uuid: self.uuid,
            epoch: self.epoch,
            key_pattern: self.key_pattern.clone(),
            default_collation: self.default_collation.clone(),
            unique: self.unique,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: ShardId,
    pub connection_string: ConnectionString,
    pub max_size_bytes: u64,
    pub draining: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRange {
    pub ns: Namespace,
    pub range: KeyRange,
    pub zone: String,
}

/// Lease-based lock record. A lock whose lease has run out may be overtaken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDocument {
    pub name: String,
    pub holder: String,
    pub lock_id: Uuid,
    pub lease_at_ms: u64,
    pub lease_ms: u64,
    pub why: String,
}

impl LockDocument {
    pub fn expired(&self, now_ms: u64) -> bool {
        self.lease_at_ms.saturating_add(self.lease_ms) < now_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    /// Documents are being copied; the source still owns the range.
    Cloning,
    /// The catalog lists the destination as owner; only cleanup remains.
    Committed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDocument {
    pub id: Uuid,
    pub ns: Namespace,
    pub collection_uuid: Uuid,
    pub range: KeyRange,
    pub from: ShardId,
    pub to: ShardId,
    pub expected_version: ChunkVersion,
    pub state: MigrationState,
    pub started_at: Timestamp,
}

/// Orphaned range a shard still has to delete after losing ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    pub id: Uuid,
    pub ns: Namespace,
    pub collection_uuid: Uuid,
    pub range: KeyRange,
    pub shard: ShardId,
    pub attempts: u32,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_database(&self, name: &str) -> Result<DatabaseEntry>;
    async fn list_databases(&self) -> Result<Vec<DatabaseEntry>>;
    async fn upsert_database(&self, entry: DatabaseEntry) -> Result<()>;

    /// `None` when the collection was never sharded.
    async fn get_collection(&self, ns: &Namespace) -> Result<Option<CollectionEntry>>;
    async fn list_collections(&self, db: Option<&str>) -> Result<Vec<CollectionEntry>>;

    /// All chunks, or only those at or above `since` when it carries the
    /// current epoch.
    async fn get_chunks(&self, ns: &Namespace, since: Option<ChunkVersion>) -> Result<Vec<Chunk>>;

    /// Atomically remove the chunks starting at `remove` and upsert `upsert`,
    /// provided the collection version still equals `expected`.
    async fn commit_chunk_changes(
        &self,
        ns: &Namespace,
        expected: ChunkVersion,
        remove: Vec<ShardKey>,
        upsert: Vec<Chunk>,
    ) -> Result<()>;

    /// Install a new incarnation of a collection in one step.
    async fn replace_collection(
        &self,
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
        tags: Vec<TagRange>,
    ) -> Result<()>;
    async fn drop_collection(&self, ns: &Namespace) -> Result<()>;
    async fn rename_collection(&self, from: &Namespace, to: &Namespace, epoch: Epoch) -> Result<()>;

    async fn list_shards(&self) -> Result<Vec<ShardEntry>>;
    async fn add_shard(&self, entry: ShardEntry) -> Result<()>;
    async fn update_shard(&self, entry: ShardEntry) -> Result<()>;
    async fn remove_shard(&self, id: &ShardId) -> Result<()>;

    async fn list_tags(&self, ns: &Namespace) -> Result<Vec<TagRange>>;
    async fn add_tag(&self, tag: TagRange) -> Result<()>;
    async fn remove_tag(&self, ns: &Namespace, min: &ShardKey) -> Result<()>;

    /// Take `doc.name` unless a live lease is held by someone else. Returns
    /// the current holder on failure.
    async fn try_lock(&self, doc: LockDocument, now_ms: u64) -> Result<std::result::Result<(), LockDocument>>;
    async fn renew_lock(&self, name: &str, lock_id: Uuid, now_ms: u64) -> Result<bool>;
    async fn unlock(&self, name: &str, lock_id: Uuid) -> Result<()>;
    async fn get_lock(&self, name: &str) -> Result<Option<LockDocument>>;

    async fn put_migration(&self, doc: MigrationDocument) -> Result<()>;
    async fn remove_migration(&self, id: Uuid) -> Result<()>;
    async fn list_migrations(&self) -> Result<Vec<MigrationDocument>>;

    async fn put_range_deletion(&self, task: RangeDeletionTask) -> Result<()>;
    async fn remove_range_deletion(&self, id: Uuid) -> Result<()>;
    async fn list_range_deletions(&self) -> Result<Vec<RangeDeletionTask>>;
}

/// Catalog call in wire form, for catalogs living in another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum CatalogRequest {
    GetDatabase { name: String },
    ListDatabases,
    UpsertDatabase { entry: DatabaseEntry },
    GetCollection { ns: Namespace },
    ListCollections { db: Option<String> },
    GetChunks { ns: Namespace, since: Option<ChunkVersion> },
    CommitChunkChanges {
        ns: Namespace,
        expected: ChunkVersion,
        remove: Vec<ShardKey>,
        upsert: Vec<Chunk>,
    },
    ReplaceCollection {
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
        tags: Vec<TagRange>,
    },
    DropCollection { ns: Namespace },
    RenameCollection { from: Namespace, to: Namespace, epoch: Epoch },
    ListShards,
    AddShard { entry: ShardEntry },
    UpdateShard { entry: ShardEntry },
    RemoveShard { id: ShardId },
    ListTags { ns: Namespace },
    AddTag { tag: TagRange },
    RemoveTag { ns: Namespace, min: ShardKey },
    TryLock { doc: LockDocument, now_ms: u64 },
    RenewLock { name: String, lock_id: Uuid, now_ms: u64 },
    Unlock { name: String, lock_id: Uuid },
    GetLock { name: String },
    PutMigration { doc: MigrationDocument },
    RemoveMigration { id: Uuid },
    ListMigrations,
    PutRangeDeletion { task: RangeDeletionTask },
    RemoveRangeDeletion { id: Uuid },
    ListRangeDeletions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum CatalogReply {
    Done,
    Flag(bool),
    Database(DatabaseEntry),
    Databases(Vec<DatabaseEntry>),
    Collection(Option<CollectionEntry>),
    Collections(Vec<CollectionEntry>),
    Chunks(Vec<Chunk>),
    Shards(Vec<ShardEntry>),
    Tags(Vec<TagRange>),
    LockTaken(std::result::Result<(), LockDocument>),
    Lock(Option<LockDocument>),
    Migrations(Vec<MigrationDocument>),
    RangeDeletions(Vec<RangeDeletionTask>),
}

impl CatalogReply {
    fn unexpected(&self) -> ShardgateError {
        ShardgateError::Internal(format!("unexpected catalog reply {self:?}"))
    }
}

/// Execute a wire-form request against a local catalog.
pub async fn dispatch(catalog: &dyn CatalogClient, request: CatalogRequest) -> Result<CatalogReply> {
    use CatalogRequest as R;
    Ok(match request {
        R::GetDatabase { name } => CatalogReply::Database(catalog.get_database(&name).await?),
        R::ListDatabases => CatalogReply::Databases(catalog.list_databases().await?),
        R::UpsertDatabase { entry } => {
            catalog.upsert_database(entry).await?;
            CatalogReply::Done
        }
        R::GetCollection { ns } => CatalogReply::Collection(catalog.get_collection(&ns).await?),
        R::ListCollections { db } => {
            CatalogReply::Collections(catalog.list_collections(db.as_deref()).await?)
        }
        R::GetChunks { ns, since } => CatalogReply::Chunks(catalog.get_chunks(&ns, since).await?),
        R::CommitChunkChanges {
            ns,
            expected,
            remove,
            upsert,
        } => {
            catalog.commit_chunk_changes(&ns, expected, remove, upsert).await?;
            CatalogReply::Done
        }
        R::ReplaceCollection { entry, chunks, tags } => {
            catalog.replace_collection(entry, chunks, tags).await?;
            CatalogReply::Done
        }
        R::DropCollection { ns } => {
            catalog.drop_collection(&ns).await?;
            CatalogReply::Done
        }
        R::RenameCollection { from, to, epoch } => {
            catalog.rename_collection(&from, &to, epoch).await?;
            CatalogReply::Done
        }
        R::ListShards => CatalogReply::Shards(catalog.list_shards().await?),
        R::AddShard { entry } => {
            catalog.add_shard(entry).await?;
            CatalogReply::Done
        }
        R::UpdateShard { entry } => {
            catalog.update_shard(entry).await?;
            CatalogReply::Done
        }
        R::RemoveShard { id } => {
            catalog.remove_shard(&id).await?;
            CatalogReply::Done
        }
        R::ListTags { ns } => CatalogReply::Tags(catalog.list_tags(&ns).await?),
        R::AddTag { tag } => {
            catalog.add_tag(tag).await?;
            CatalogReply::Done
        }
        R::RemoveTag { ns, min } => {
            catalog.remove_tag(&ns, &min).await?;
            CatalogReply::Done
        }
        R::TryLock { doc, now_ms } => CatalogReply::LockTaken(catalog.try_lock(doc, now_ms).await?),
        R::RenewLock {
            name,
            lock_id,
            now_ms,
        } => CatalogReply::Flag(catalog.renew_lock(&name, lock_id, now_ms).await?),
        R::Unlock { name, lock_id } => {
            catalog.unlock(&name, lock_id).await?;
            CatalogReply::Done
        }
        R::GetLock { name } => CatalogReply::Lock(catalog.get_lock(&name).await?),
        R::PutMigration { doc } => {
            catalog.put_migration(doc).await?;
            CatalogReply::Done
        }
        R::RemoveMigration { id } => {
            catalog.remove_migration(id).await?;
            CatalogReply::Done
        }
        R::ListMigrations => CatalogReply::Migrations(catalog.list_migrations().await?),
        R::PutRangeDeletion { task } => {
            catalog.put_range_deletion(task).await?;
            CatalogReply::Done
        }
        R::RemoveRangeDeletion { id } => {
            catalog.remove_range_deletion(id).await?;
            CatalogReply::Done
        }
        R::ListRangeDeletions => CatalogReply::RangeDeletions(catalog.list_range_deletions().await?),
    })
}

/// Something that can carry a `CatalogRequest` to a remote catalog.
#[async_trait]
pub trait CatalogChannel: Send + Sync {
    async fn call(&self, request: CatalogRequest) -> Result<CatalogReply>;
}

/// `CatalogClient` over any request/reply channel.
pub struct RemoteCatalog<C> {
    channel: C,
}

impl<C: CatalogChannel> RemoteCatalog<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    async fn done(&self, request: CatalogRequest) -> Result<()> {
        match self.channel.call(request).await? {
            CatalogReply::Done => Ok(()),
            other => Err(other.unexpected()),
        }
    }
}

#[async_trait]
impl<C: CatalogChannel> CatalogClient for RemoteCatalog<C> {
    async fn get_database(&self, name: &str) -> Result<DatabaseEntry> {
        match self
            .channel
            .call(CatalogRequest::GetDatabase {
                name: name.to_string(),
            })
            .await?
        {
            CatalogReply::Database(d) => Ok(d),
            other => Err(other.unexpected()),
        }
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseEntry>> {
        match self.channel.call(CatalogRequest::ListDatabases).await? {
            CatalogReply::Databases(d) => Ok(d),
            other => Err(other.unexpected()),
        }
    }

    async fn upsert_database(&self, entry: DatabaseEntry) -> Result<()> {
        self.done(CatalogRequest::UpsertDatabase { entry }).await
    }

    async fn get_collection(&self, ns: &Namespace) -> Result<Option<CollectionEntry>> {
        match self
            .channel
            .call(CatalogRequest::GetCollection { ns: ns.clone() })
            .await?
        {
            CatalogReply::Collection(c) => Ok(c),
            other => Err(other.unexpected()),
        }
    }

    async fn list_collections(&self, db: Option<&str>) -> Result<Vec<CollectionEntry>> {
        match self
            .channel
            .call(CatalogRequest::ListCollections {
                db: db.map(str::to_string),
            })
            .await?
        {
            CatalogReply::Collections(c) => Ok(c),
            other => Err(other.unexpected()),
        }
    }

    async fn get_chunks(&self, ns: &Namespace, since: Option<ChunkVersion>) -> Result<Vec<Chunk>> {
        match self
            .channel
            .call(CatalogRequest::GetChunks {
                ns: ns.clone(),
                since,
            })
            .await?
        {
            CatalogReply::Chunks(c) => Ok(c),
            other => Err(other.unexpected()),
        }
    }

    async fn commit_chunk_changes(
        &self,
        ns: &Namespace,
        expected: ChunkVersion,
        remove: Vec<ShardKey>,
        upsert: Vec<Chunk>,
    ) -> Result<()> {
        self.done(CatalogRequest::CommitChunkChanges {
            ns: ns.clone(),
            expected,
            remove,
            upsert,
        })
        .await
    }

    async fn replace_collection(
        &self,
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
        tags: Vec<TagRange>,
    ) -> Result<()> {
        self.done(CatalogRequest::ReplaceCollection { entry, chunks, tags })
            .await
    }

    async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        self.done(CatalogRequest::DropCollection { ns: ns.clone() }).await
    }

    async fn rename_collection(&self, from: &Namespace, to: &Namespace, epoch: Epoch) -> Result<()> {
        self.done(CatalogRequest::RenameCollection {
            from: from.clone(),
            to: to.clone(),
            epoch,
        })
        .await
    }

    async fn list_shards(&self) -> Result<Vec<ShardEntry>> {
        match self.channel.call(CatalogRequest::ListShards).await? {
            CatalogReply::Shards(s) => Ok(s),
            other => Err(other.unexpected()),
        }
    }

    async fn add_shard(&self, entry: ShardEntry) -> Result<()> {
        self.done(CatalogRequest::AddShard { entry }).await
    }

    async fn update_shard(&self, entry: ShardEntry) -> Result<()> {
        self.done(CatalogRequest::UpdateShard { entry }).await
    }

    async fn remove_shard(&self, id: &ShardId) -> Result<()> {
        self.done(CatalogRequest::RemoveShard { id: id.clone() }).await
    }

    async fn list_tags(&self, ns: &Namespace) -> Result<Vec<TagRange>> {
        match self
            .channel
            .call(CatalogRequest::ListTags { ns: ns.clone() })
            .await?
        {
            CatalogReply::Tags(t) => Ok(t),
            other => Err(other.unexpected()),
        }
    }

    async fn add_tag(&self, tag: TagRange) -> Result<()> {
        self.done(CatalogRequest::AddTag { tag }).await
    }

    async fn remove_tag(&self, ns: &Namespace, min: &ShardKey) -> Result<()> {
        self.done(CatalogRequest::RemoveTag {
            ns: ns.clone(),
            min: min.clone(),
        })
        .await
    }

    async fn try_lock(&self, doc: LockDocument, now_ms: u64) -> Result<std::result::Result<(), LockDocument>> {
        match self.channel.call(CatalogRequest::TryLock { doc, now_ms }).await? {
            CatalogReply::LockTaken(r) => Ok(r),
            other => Err(other.unexpected()),
        }
    }

    async fn renew_lock(&self, name: &str, lock_id: Uuid, now_ms: u64) -> Result<bool> {
        match self
            .channel
            .call(CatalogRequest::RenewLock {
                name: name.to_string(),
                lock_id,
                now_ms,
            })
            .await?
        {
            CatalogReply::Flag(f) => Ok(f),
            other => Err(other.unexpected()),
        }
    }

    async fn unlock(&self, name: &str, lock_id: Uuid) -> Result<()> {
        self.done(CatalogRequest::Unlock {
            name: name.to_string(),
            lock_id,
        })
        .await
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockDocument>> {
        match self
            .channel
            .call(CatalogRequest::GetLock {
                name: name.to_string(),
            })
            .await?
        {
            CatalogReply::Lock(l) => Ok(l),
            other => Err(other.unexpected()),
        }
    }

    async fn put_migration(&self, doc: MigrationDocument) -> Result<()> {
        self.done(CatalogRequest::PutMigration { doc }).await
    }

    async fn remove_migration(&self, id: Uuid) -> Result<()> {
        self.done(CatalogRequest::RemoveMigration { id }).await
    }

    async fn list_migrations(&self) -> Result<Vec<MigrationDocument>> {
        match self.channel.call(CatalogRequest::ListMigrations).await? {
            CatalogReply::Migrations(m) => Ok(m),
            other => Err(other.unexpected()),
        }
    }

    async fn put_range_deletion(&self, task: RangeDeletionTask) -> Result<()> {
        self.done(CatalogRequest::PutRangeDeletion { task }).await
    }

    async fn remove_range_deletion(&self, id: Uuid) -> Result<()> {
        self.done(CatalogRequest::RemoveRangeDeletion { id }).await
    }

    async fn list_range_deletions(&self) -> Result<Vec<RangeDeletionTask>> {
        match self.channel.call(CatalogRequest::ListRangeDeletions).await? {
            CatalogReply::RangeDeletions(r) => Ok(r),
            other => Err(other.unexpected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_leases_expire() {
        let doc = LockDocument {
            name: "db.c".into(),
            holder: "p1".into(),
            lock_id: Uuid::new_v4(),
            lease_at_ms: 1_000,
            lease_ms: 500,
            why: "split".into(),
        };
        assert!(!doc.expired(1_400));
        assert!(!doc.expired(1_500));
        assert!(doc.expired(1_501));
    }

    #[test]
    fn requests_have_stable_json_shape() {
        let req = CatalogRequest::GetChunks {
            ns: Namespace::new("db", "c"),
            since: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["op"], "getChunks");
        let back: CatalogRequest = serde_json::from_value(v).unwrap();
        assert!(matches!(back, CatalogRequest::GetChunks { since: None, .. }));
    }
}
