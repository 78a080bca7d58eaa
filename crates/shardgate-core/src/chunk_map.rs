use crate::chunk::Chunk;
use crate::clock::Timestamp;
use crate::error::{Result, ShardgateError};
use crate::key::{KeyRange, ShardKey, ShardKeyPattern};
use crate::namespace::{Namespace, ShardId};
use crate::query::{bounds_for_filter, Collation, KeyInterval};
use crate::version::{ChunkVersion, Epoch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Collection-level facts every chunk map of one incarnation shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub ns: Namespace,
    pub uuid: Uuid,
    pub epoch: Epoch,
    pub key_pattern: ShardKeyPattern,
    pub default_collation: Collation,
    pub unique: bool,
}

/// Result of applying changed chunks on top of an existing map.
#[derive(Debug)]
pub enum DiffOutcome {
    Applied(ChunkMap),
    /// Nothing changed; keep publishing the prior map.
    Unchanged,
    /// The diff belongs to another incarnation; reload from scratch.
    EpochChanged,
    /// The merged result broke an invariant; reload from scratch.
    Inconsistent(ShardgateError),
}

/// Immutable range-to-shard mapping for one collection, keyed by chunk max.
#[derive(Debug, Clone)]
pub struct ChunkMap {
    meta: CollectionMetadata,
    chunks: BTreeMap<ShardKey, Chunk>,
    collection_version: ChunkVersion,
    shard_versions: HashMap<ShardId, ChunkVersion>,
    sequence: u64,
}

impl ChunkMap {
    /// Build a map from a full set of chunks, checking coverage, contiguity
    /// and version bookkeeping.
    pub fn build(meta: CollectionMetadata, chunks: Vec<Chunk>) -> Result<Self> {
        let width = meta.key_pattern.len();
        let mut by_max = BTreeMap::new();
        for chunk in chunks {
            chunk.validate()?;
            if chunk.version.epoch != meta.epoch {
                return Err(ShardgateError::InconsistentChunkMap(format!(
                    "chunk {} of {} has epoch {} but the collection has epoch {}",
                    chunk.range, meta.ns, chunk.version.epoch, meta.epoch
                )));
            }
            if chunk.range.min.len() != width || chunk.range.max.len() != width {
                return Err(ShardgateError::InconsistentChunkMap(format!(
                    "chunk {} does not match shard key {}",
                    chunk.range, meta.key_pattern
                )));
            }
            let max = chunk.range.max.clone();
            if let Some(dup) = by_max.insert(max, chunk) {
                return Err(ShardgateError::InconsistentChunkMap(format!(
                    "two chunks of {} end at {}",
                    meta.ns, dup.range.max
                )));
            }
        }

        let mut collection_version = ChunkVersion::zero(meta.epoch);
        let mut shard_versions: HashMap<ShardId, ChunkVersion> = HashMap::new();
        let mut prev: Option<&Chunk> = None;
        for chunk in by_max.values() {
            match prev {
                None if !chunk.range.min.is_global_min() => {
                    return Err(ShardgateError::InconsistentChunkMap(format!(
                        "first chunk of {} starts at {} instead of MinKey",
                        meta.ns, chunk.range.min
                    )))
                }
                Some(p) if p.range.max != chunk.range.min => {
                    return Err(ShardgateError::InconsistentChunkMap(format!(
                        "chunks {} and {} of {} are not contiguous",
                        p.range, chunk.range, meta.ns
                    )))
                }
                _ => {}
            }
            if collection_version.is_older_than(&chunk.version) {
                collection_version = chunk.version;
            }
            let entry = shard_versions
                .entry(chunk.shard.clone())
                .or_insert_with(|| ChunkVersion::zero(meta.epoch));
            if entry.is_older_than(&chunk.version) {
                *entry = chunk.version;
            }
            prev = Some(chunk);
        }
        if let Some(last) = prev {
            if !last.range.max.is_global_max() {
                return Err(ShardgateError::InconsistentChunkMap(format!(
                    "last chunk of {} ends at {} instead of MaxKey",
                    meta.ns, last.range.max
                )));
            }
        }

        Ok(Self {
            meta,
            chunks: by_max,
            collection_version,
            shard_versions,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Apply changed chunks (typically everything at or above the cached
    /// collection version) to produce the next map.
    pub fn apply_diff(&self, changed: Vec<Chunk>) -> DiffOutcome {
        if changed.is_empty() {
            return DiffOutcome::Unchanged;
        }
        if changed.iter().any(|c| c.version.epoch != self.meta.epoch) {
            return DiffOutcome::EpochChanged;
        }
        if changed
            .iter()
            .all(|c| self.chunks.get(&c.range.max) == Some(c))
        {
            return DiffOutcome::Unchanged;
        }

        let mut merged = self.chunks.clone();
        for incoming in &changed {
            let doomed: Vec<ShardKey> = merged
                .range((Excluded(incoming.range.min.clone()), Unbounded))
                .take_while(|(_, c)| c.range.min < incoming.range.max)
                .map(|(max, _)| max.clone())
                .collect();
            for max in doomed {
                merged.remove(&max);
            }
        }
        let mut incoming = changed;
        incoming.sort_by_key(|c| (c.version.major, c.version.minor));
        let mut all: Vec<Chunk> = merged.into_values().collect();
        all.extend(incoming);

        match ChunkMap::build(self.meta.clone(), all) {
            Ok(next) if self.collection_version.is_older_than(&next.collection_version) => {
                DiffOutcome::Applied(next)
            }
            Ok(next) => DiffOutcome::Inconsistent(ShardgateError::InconsistentChunkMap(format!(
                "diff for {} moved collection version from {} to {}",
                self.meta.ns, self.collection_version, next.collection_version
            ))),
            Err(err) => DiffOutcome::Inconsistent(err),
        }
    }

    pub fn metadata(&self) -> &CollectionMetadata {
        &self.meta
    }

    pub fn ns(&self) -> &Namespace {
        &self.meta.ns
    }

    pub fn uuid(&self) -> Uuid {
        self.meta.uuid
    }

    pub fn epoch(&self) -> Epoch {
        self.meta.epoch
    }

    pub fn key_pattern(&self) -> &ShardKeyPattern {
        &self.meta.key_pattern
    }

    pub fn default_collation(&self) -> &Collation {
        &self.meta.default_collation
    }

    pub fn is_unique(&self) -> bool {
        self.meta.unique
    }

    /// Unique id of this published map, distinct for every build.
    pub fn sequence_number(&self) -> u64 {
        self.sequence
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunks_on_shard<'a>(&'a self, shard: &'a ShardId) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks.values().filter(move |c| &c.shard == shard)
    }

    pub fn collection_version(&self) -> ChunkVersion {
        self.collection_version
    }

    /// Highest version among the shard's chunks, `{epoch, 0, 0}` if it owns none.
    pub fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        self.shard_versions
            .get(shard)
            .copied()
            .unwrap_or_else(|| ChunkVersion::zero(self.meta.epoch))
    }

    pub fn all_shard_ids(&self) -> BTreeSet<ShardId> {
        self.shard_versions.keys().cloned().collect()
    }

    pub fn find_intersecting_chunk(&self, key: &ShardKey) -> Result<&Chunk> {
        if key.len() != self.meta.key_pattern.len() {
            return Err(ShardgateError::BadValue(format!(
                "key {key} does not match shard key {}",
                self.meta.key_pattern
            )));
        }
        self.chunks
            .range((Excluded(key.clone()), Unbounded))
            .next()
            .map(|(_, c)| c)
            .or_else(|| self.chunks.values().next_back())
            .ok_or_else(|| {
                ShardgateError::KeyOutOfRange(format!("{key} in empty chunk map for {}", self.meta.ns))
            })
    }

    pub fn find_chunk_for_document(&self, doc: &Value) -> Result<&Chunk> {
        let key = self.meta.key_pattern.extract_from_document(doc)?;
        self.find_intersecting_chunk(&key)
    }

    /// Chunks intersecting `[min, max)`, in key order.
    pub fn chunks_for_range(&self, min: &ShardKey, max: &ShardKey) -> Vec<&Chunk> {
        self.chunks_for_interval(&KeyInterval {
            min: min.clone(),
            max: max.clone(),
            max_inclusive: false,
        })
    }

    pub fn chunks_for_interval(&self, interval: &KeyInterval) -> Vec<&Chunk> {
        let mut out: Vec<&Chunk> = self
            .chunks
            .range((Excluded(interval.min.clone()), Unbounded))
            .map(|(_, c)| c)
            .take_while(|c| {
                c.range.min < interval.max || (interval.max_inclusive && c.range.min == interval.max)
            })
            .collect();
        if out.is_empty() {
            // Only a key at MaxKey lies past every chunk max.
            if let Some(last) = self.chunks.values().next_back() {
                if interval.min >= last.range.min && interval.min.is_global_max() {
                    out.push(last);
                }
            }
        }
        out
    }

    /// Shards that may hold documents matching `filter`. Never empty for a
    /// non-empty map.
    pub fn shards_for_query(&self, filter: &Value, collation: Option<&Collation>) -> BTreeSet<ShardId> {
        let collation = collation.unwrap_or(&self.meta.default_collation);
        let intervals = bounds_for_filter(&self.meta.key_pattern, filter, collation);
        let mut shards = BTreeSet::new();
        for interval in &intervals {
            if interval.is_full() {
                return self.all_shard_ids();
            }
            for chunk in self.chunks_for_interval(interval) {
                shards.insert(chunk.shard.clone());
            }
        }
        if shards.is_empty() {
            // A contradictory predicate still needs one shard to answer it.
            if let Some(first) = self.chunks.values().next() {
                shards.insert(first.shard.clone());
            }
        }
        shards
    }

    pub fn shards_for_range(&self, range: &KeyRange) -> BTreeSet<ShardId> {
        self.chunks_for_range(&range.min, &range.max)
            .into_iter()
            .map(|c| c.shard.clone())
            .collect()
    }

    /// Owner of `key` as of `ts`, from chunk history. `None` when the history
    /// no longer reaches back to `ts`.
    pub fn shard_for_key_at(&self, key: &ShardKey, ts: Timestamp) -> Result<Option<ShardId>> {
        Ok(self.find_intersecting_chunk(key)?.shard_at(ts).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;
    use serde_json::json;

    fn k(v: i64) -> ShardKey {
        ShardKey::new(vec![KeyValue::Int(v)])
    }

    fn meta(epoch: Epoch) -> CollectionMetadata {
        CollectionMetadata {
            ns: Namespace::new("db", "c"),
            uuid: Uuid::nil(),
            epoch,
            key_pattern: ShardKeyPattern::new(vec!["x"]).unwrap(),
            default_collation: Collation::simple(),
            unique: false,
        }
    }

    fn chunk(min: ShardKey, max: ShardKey, shard: &str, v: ChunkVersion) -> Chunk {
        Chunk::new(
            Uuid::nil(),
            KeyRange::new(min, max).unwrap(),
            shard.into(),
            v,
            Timestamp::new(1, 1),
        )
    }

    fn two_chunk_map(e: Epoch) -> ChunkMap {
        ChunkMap::build(
            meta(e),
            vec![
                chunk(ShardKey::global_min(1), k(10), "A", ChunkVersion::new(e, 1, 0)),
                chunk(k(10), ShardKey::global_max(1), "B", ChunkVersion::new(e, 1, 1)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn lookups_cover_the_whole_key_space() {
        let e = Epoch::generate();
        let map = two_chunk_map(e);
        assert_eq!(map.find_intersecting_chunk(&k(-100)).unwrap().shard, ShardId::new("A"));
        assert_eq!(map.find_intersecting_chunk(&k(10)).unwrap().shard, ShardId::new("B"));
        assert_eq!(
            map.find_intersecting_chunk(&ShardKey::global_max(1)).unwrap().shard,
            ShardId::new("B")
        );
        assert_eq!(
            map.find_intersecting_chunk(&ShardKey::global_min(1)).unwrap().shard,
            ShardId::new("A")
        );
        assert_eq!(map.collection_version(), ChunkVersion::new(e, 1, 1));
        assert_eq!(map.shard_version(&"A".into()), ChunkVersion::new(e, 1, 0));
        assert_eq!(map.shard_version(&"Z".into()), ChunkVersion::zero(e));
    }

    #[test]
    fn empty_map_reports_key_out_of_range() {
        let map = ChunkMap::build(meta(Epoch::generate()), Vec::new()).unwrap();
        assert!(matches!(
            map.find_intersecting_chunk(&k(1)),
            Err(ShardgateError::KeyOutOfRange(_))
        ));
        assert!(map.shards_for_query(&json!({}), None).is_empty());
    }

    #[test]
    fn build_rejects_gaps_overlaps_and_mixed_epochs() {
        let e = Epoch::generate();
        let gap = ChunkMap::build(
            meta(e),
            vec![
                chunk(ShardKey::global_min(1), k(5), "A", ChunkVersion::new(e, 1, 0)),
                chunk(k(6), ShardKey::global_max(1), "B", ChunkVersion::new(e, 1, 1)),
            ],
        );
        assert!(matches!(gap, Err(ShardgateError::InconsistentChunkMap(_))));

        let no_min = ChunkMap::build(
            meta(e),
            vec![chunk(k(0), ShardKey::global_max(1), "A", ChunkVersion::new(e, 1, 0))],
        );
        assert!(no_min.is_err());

        let mixed = ChunkMap::build(
            meta(e),
            vec![
                chunk(ShardKey::global_min(1), k(5), "A", ChunkVersion::new(e, 1, 0)),
                chunk(k(5), ShardKey::global_max(1), "B", ChunkVersion::new(Epoch::generate(), 1, 1)),
            ],
        );
        assert!(mixed.is_err());
    }

    #[test]
    fn split_diff_bumps_major_and_minor() {
        let e = Epoch::generate();
        let map = two_chunk_map(e);
        let major = map.collection_version().major + 1;
        let diff = vec![
            chunk(ShardKey::global_min(1), k(5), "A", ChunkVersion::new(e, major, 0)),
            chunk(k(5), k(10), "A", ChunkVersion::new(e, major, 1)),
        ];
        let DiffOutcome::Applied(next) = map.apply_diff(diff) else {
            panic!("expected diff to apply");
        };
        assert_eq!(next.num_chunks(), 3);
        assert_eq!(next.collection_version(), ChunkVersion::new(e, major, 1));
        assert!(map.collection_version() < next.collection_version());
        assert_eq!(next.shard_version(&"B".into()), ChunkVersion::new(e, 1, 1));
        assert_ne!(next.sequence_number(), map.sequence_number());
        assert_eq!(next.find_intersecting_chunk(&k(7)).unwrap().range.min, k(5));
    }

    #[test]
    fn diff_edge_cases() {
        let e = Epoch::generate();
        let map = two_chunk_map(e);
        assert!(matches!(map.apply_diff(Vec::new()), DiffOutcome::Unchanged));

        let same: Vec<Chunk> = map.chunks().cloned().collect();
        assert!(matches!(map.apply_diff(same), DiffOutcome::Unchanged));

        let other = Epoch::generate();
        let foreign = vec![chunk(ShardKey::global_min(1), k(10), "A", ChunkVersion::new(other, 1, 0))];
        assert!(matches!(map.apply_diff(foreign), DiffOutcome::EpochChanged));

        // Leaves a hole between 3 and 10.
        let holey = vec![chunk(ShardKey::global_min(1), k(3), "A", ChunkVersion::new(e, 2, 0))];
        assert!(matches!(map.apply_diff(holey), DiffOutcome::Inconsistent(_)));
    }

    #[test]
    fn query_targeting_prunes_and_deduplicates() {
        let e = Epoch::generate();
        let map = two_chunk_map(e);
        let only_a = map.shards_for_query(&json!({"x": 3}), None);
        assert_eq!(only_a.into_iter().collect::<Vec<_>>(), vec![ShardId::new("A")]);

        let straddle = map.shards_for_query(&json!({"x": {"$gte": 5, "$lte": 15}}), None);
        assert_eq!(straddle.len(), 2);

        // An exclusive upper bound at a chunk boundary stays on one side.
        let below = map.shards_for_query(&json!({"x": {"$lt": 10}}), None);
        assert_eq!(below.into_iter().collect::<Vec<_>>(), vec![ShardId::new("A")]);

        let everything = map.shards_for_query(&json!({"y": 1}), None);
        assert_eq!(everything.len(), 2);

        let nothing = map.shards_for_query(&json!({"x": {"$gt": 20, "$lt": 1}}), None);
        assert_eq!(nothing.len(), 1);
    }

    #[test]
    fn point_in_time_routing_follows_history() {
        let e = Epoch::generate();
        let map = two_chunk_map(e);
        let moved = map
            .find_intersecting_chunk(&k(1))
            .unwrap()
            .with_new_owner("B".into(), ChunkVersion::new(e, 2, 0), Timestamp::new(50, 1), 3600);
        let DiffOutcome::Applied(next) = map.apply_diff(vec![moved]) else {
            panic!("expected diff to apply");
        };
        assert_eq!(
            next.shard_for_key_at(&k(1), Timestamp::new(10, 0)).unwrap(),
            Some(ShardId::new("A"))
        );
        assert_eq!(
            next.shard_for_key_at(&k(1), Timestamp::new(60, 0)).unwrap(),
            Some(ShardId::new("B"))
        );
        assert_eq!(next.all_shard_ids().len(), 1);
        assert_eq!(next.shard_version(&"A".into()), ChunkVersion::zero(e));
    }
}
