//! Per-namespace routing information with a single loader per namespace.
//!
//! Callers share one in-flight catalog load. Loads run on their own task so
//! a caller that gives up cannot strand the others. A stale-config signal
//! marks the entry for refresh; the next load tries an incremental diff
//! against the cached map and falls back to a full load when the diff does
//! not apply.

use crate::catalog::{CatalogClient, DatabaseEntry};
use crate::chunk_map::{ChunkMap, DiffOutcome};
use crate::error::{Result, ShardgateError};
use crate::namespace::{Namespace, ShardId};
use crate::query::Collation;
use crate::version::ChunkVersion;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum RoutingInfo {
    Sharded { map: Arc<ChunkMap>, primary: ShardId },
    Unsharded { primary: ShardId },
    Dropped,
}

impl RoutingInfo {
    pub fn chunk_map(&self) -> Option<&Arc<ChunkMap>> {
        match self {
            RoutingInfo::Sharded { map, .. } => Some(map),
            _ => None,
        }
    }

    pub fn primary(&self) -> Option<&ShardId> {
        match self {
            RoutingInfo::Sharded { primary, .. } | RoutingInfo::Unsharded { primary } => Some(primary),
            RoutingInfo::Dropped => None,
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, RoutingInfo::Sharded { .. })
    }

    /// Version to attach to a request for `shard`.
    pub fn version_for(&self, shard: &ShardId) -> ChunkVersion {
        match self {
            RoutingInfo::Sharded { map, .. } => map.shard_version(shard),
            RoutingInfo::Unsharded { .. } => ChunkVersion::UNSHARDED,
            RoutingInfo::Dropped => ChunkVersion::DROPPED,
        }
    }

    /// Shards a query with `filter` has to visit.
    pub fn target_shards(&self, ns: &Namespace, filter: &Value, collation: Option<&Collation>) -> Result<BTreeSet<ShardId>> {
        match self {
            RoutingInfo::Sharded { map, .. } => Ok(map.shards_for_query(filter, collation)),
            RoutingInfo::Unsharded { primary } => Ok(BTreeSet::from([primary.clone()])),
            RoutingInfo::Dropped => Err(ShardgateError::NamespaceNotFound(ns.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub full_loads: u64,
    pub diff_loads: u64,
}

type Waiter = oneshot::Sender<Result<RoutingInfo>>;

#[derive(Default)]
struct CacheEntry {
    info: Option<RoutingInfo>,
    needs_refresh: bool,
    force_full: bool,
    /// Bumped by purges; a load started under an older generation does not
    /// install its result.
    generation: u64,
    /// Bumped by every stale signal. A load only clears the refresh flags
    /// when no signal arrived while it ran.
    refresh_seq: u64,
    loading: Option<Vec<Waiter>>,
}

/// What a load needs to know about the entry it was started for.
struct LoadTicket {
    previous: Option<RoutingInfo>,
    generation: u64,
    refresh_seq: u64,
}

impl LoadTicket {
    fn for_entry(entry: &CacheEntry) -> Self {
        Self {
            previous: if entry.force_full { None } else { entry.info.clone() },
            generation: entry.generation,
            refresh_seq: entry.refresh_seq,
        }
    }
}

struct CacheInner {
    catalog: Arc<dyn CatalogClient>,
    entries: Mutex<HashMap<Namespace, CacheEntry>>,
    databases: Mutex<HashMap<String, DatabaseEntry>>,
    full_loads: AtomicU64,
    diff_loads: AtomicU64,
}

#[derive(Clone)]
pub struct RoutingCache {
    inner: Arc<CacheInner>,
}

impl RoutingCache {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                catalog,
                entries: Mutex::new(HashMap::new()),
                databases: Mutex::new(HashMap::new()),
                full_loads: AtomicU64::new(0),
                diff_loads: AtomicU64::new(0),
            }),
        }
    }

    pub async fn get_routing_info(&self, ns: &Namespace) -> Result<RoutingInfo> {
        let rx = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(ns.clone()).or_default();
            if let (Some(info), false) = (&entry.info, entry.needs_refresh) {
                return Ok(info.clone());
            }
            let (tx, rx) = oneshot::channel();
            match entry.loading.as_mut() {
                Some(waiters) => waiters.push(tx),
                None => {
                    entry.loading = Some(vec![tx]);
                    let ticket = LoadTicket::for_entry(entry);
                    let inner = self.inner.clone();
                    let ns = ns.clone();
                    tokio::spawn(async move { inner.run_load(ns, ticket).await });
                }
            }
            rx
        };
        rx.await
            .map_err(|_| ShardgateError::Internal(format!("routing load for {ns} was abandoned")))?
    }

    /// Cached routing info without loading.
    pub fn peek(&self, ns: &Namespace) -> Option<RoutingInfo> {
        self.inner.entries.lock().get(ns).and_then(|e| e.info.clone())
    }

    /// React to a shard rejecting `ns` as stale. `wanted` is the version the
    /// shard reported for `shard`, if it knew one. Returns whether the entry
    /// was marked for refresh.
    pub fn on_stale_config(&self, ns: &Namespace, wanted: Option<ChunkVersion>, shard: Option<&ShardId>) -> bool {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(ns.clone()).or_default();
        let (refresh, full) = match (&entry.info, wanted) {
            (Some(RoutingInfo::Sharded { map, .. }), Some(wanted)) => {
                let cached = shard
                    .map(|s| map.shard_version(s))
                    .unwrap_or_else(|| map.collection_version());
                if !wanted.same_epoch(&cached) {
                    (true, true)
                } else if !wanted.is_set() || cached.is_older_than(&wanted) {
                    (true, false)
                } else {
                    (false, false)
                }
            }
            (Some(RoutingInfo::Sharded { .. }), None) => (true, false),
            _ => (true, true),
        };
        if refresh {
            debug!(%ns, wanted = ?wanted, full, "routing info marked stale");
            entry.needs_refresh = true;
            entry.force_full |= full;
            entry.refresh_seq += 1;
        }
        refresh
    }

    /// Forget everything cached for `ns`.
    pub fn purge(&self, ns: &Namespace) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(ns) {
            entry.info = None;
            entry.needs_refresh = true;
            entry.force_full = true;
            entry.generation += 1;
        }
    }

    pub fn purge_database(&self, db: &str) {
        self.inner.databases.lock().remove(db);
        let mut entries = self.inner.entries.lock();
        for (_, entry) in entries.iter_mut().filter(|(ns, _)| ns.db == db) {
            entry.info = None;
            entry.needs_refresh = true;
            entry.force_full = true;
            entry.generation += 1;
        }
    }

    pub async fn get_database(&self, name: &str) -> Result<DatabaseEntry> {
        if let Some(db) = self.inner.databases.lock().get(name) {
            return Ok(db.clone());
        }
        self.inner.load_database(name).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            full_loads: self.inner.full_loads.load(Ordering::Relaxed),
            diff_loads: self.inner.diff_loads.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    async fn load_database(&self, name: &str) -> Result<DatabaseEntry> {
        let db = self.catalog.get_database(name).await?;
        self.databases.lock().insert(name.to_string(), db.clone());
        Ok(db)
    }

    async fn run_load(self: Arc<Self>, ns: Namespace, ticket: LoadTicket) {
        let result = self.load(&ns, ticket.previous).await;
        let waiters = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(ns.clone()).or_default();
            let waiters = entry.loading.take().unwrap_or_default();
            match &result {
                Ok(info) if entry.generation == ticket.generation => {
                    entry.info = Some(newer_of(entry.info.take(), info.clone()));
                    if entry.refresh_seq == ticket.refresh_seq {
                        entry.needs_refresh = false;
                        entry.force_full = false;
                    } else {
                        debug!(%ns, "stale signal arrived during load, keeping entry marked");
                    }
                }
                Ok(_) => debug!(%ns, "discarding routing load that raced a purge"),
                Err(e) => warn!(%ns, error = %e, "routing load failed"),
            }
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn load(&self, ns: &Namespace, previous: Option<RoutingInfo>) -> Result<RoutingInfo> {
        let entry = match self.catalog.get_collection(ns).await? {
            None => {
                let db = self.load_database(&ns.db).await?;
                return Ok(RoutingInfo::Unsharded { primary: db.primary });
            }
            Some(entry) if entry.dropped => return Ok(RoutingInfo::Dropped),
            Some(entry) => entry,
        };
        let primary = self.load_database(&ns.db).await?.primary;

        if let Some(RoutingInfo::Sharded { map, .. }) = previous.as_ref() {
            if map.epoch() == entry.epoch {
                let changed = self.catalog.get_chunks(ns, Some(map.collection_version())).await?;
                match map.apply_diff(changed) {
                    DiffOutcome::Applied(next) => {
                        self.diff_loads.fetch_add(1, Ordering::Relaxed);
                        debug!(%ns, version = %next.collection_version(), "routing diff applied");
                        return Ok(RoutingInfo::Sharded {
                            map: Arc::new(next),
                            primary,
                        });
                    }
                    DiffOutcome::Unchanged => {
                        self.diff_loads.fetch_add(1, Ordering::Relaxed);
                        return Ok(RoutingInfo::Sharded {
                            map: map.clone(),
                            primary,
                        });
                    }
                    DiffOutcome::EpochChanged => {}
                    DiffOutcome::Inconsistent(e) => {
                        warn!(%ns, error = %e, "routing diff inconsistent, reloading from scratch");
                    }
                }
            }
        }

        let chunks = self.catalog.get_chunks(ns, None).await?;
        let map = ChunkMap::build(entry.metadata(), chunks)?;
        self.full_loads.fetch_add(1, Ordering::Relaxed);
        info!(%ns, version = %map.collection_version(), chunks = map.num_chunks(), "routing table loaded");
        Ok(RoutingInfo::Sharded {
            map: Arc::new(map),
            primary,
        })
    }
}

/// Keep the cached map when a late load would move it backwards within
/// the same epoch.
fn newer_of(current: Option<RoutingInfo>, loaded: RoutingInfo) -> RoutingInfo {
    if let (Some(RoutingInfo::Sharded { map: old, .. }), RoutingInfo::Sharded { map: new, .. }) = (&current, &loaded) {
        if new.collection_version().is_older_than(&old.collection_version()) {
            if let Some(current) = current {
                return current;
            }
        }
    }
    loaded
}
