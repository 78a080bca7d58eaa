use crate::clock::Timestamp;
use crate::error::{Result, ShardgateError};
use crate::key::{KeyRange, ShardKey};
use crate::namespace::ShardId;
use crate::version::ChunkVersion;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One past or present owner of a chunk, newest first in `Chunk::history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHistory {
    pub valid_after: Timestamp,
    pub shard: ShardId,
}

/// Contiguous range of a collection owned by one shard. A plain value: the
/// chunk map holds chunks by value and nothing points back at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub collection_uuid: Uuid,
    pub range: KeyRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    pub history: Vec<ChunkHistory>,
    #[serde(default)]
    pub jumbo: bool,
}

impl Chunk {
    pub fn new(
        collection_uuid: Uuid,
        range: KeyRange,
        shard: ShardId,
        version: ChunkVersion,
        valid_after: Timestamp,
    ) -> Self {
        let history = vec![ChunkHistory {
            valid_after,
            shard: shard.clone(),
        }];
        Self {
            collection_uuid,
            range,
            shard,
            version,
            history,
            jumbo: false,
        }
    }

    pub fn min(&self) -> &ShardKey {
        &self.range.min
    }

    pub fn max(&self) -> &ShardKey {
        &self.range.max
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        self.range.contains(key)
    }

    pub fn validate(&self) -> Result<()> {
        match self.history.first() {
            Some(head) if head.shard == self.shard => {}
            Some(head) => {
                return Err(ShardgateError::InconsistentChunkMap(format!(
                    "chunk {} is owned by {} but its history starts with {}",
                    self.range, self.shard, head.shard
                )))
            }
            None => {
                return Err(ShardgateError::InconsistentChunkMap(format!(
                    "chunk {} has no ownership history",
                    self.range
                )))
            }
        }
        if self.range.min >= self.range.max {
            return Err(ShardgateError::InconsistentChunkMap(format!(
                "chunk {} is empty",
                self.range
            )));
        }
        Ok(())
    }

    /// Owner of this chunk as of `ts`, if the history reaches back that far.
    pub fn shard_at(&self, ts: Timestamp) -> Option<&ShardId> {
        self.history
            .iter()
            .find(|h| h.valid_after <= ts)
            .map(|h| &h.shard)
    }

    /// Copy of this chunk owned by `to` from `at` onward. History entries
    /// older than `window_secs` are dropped, but the newest prior owner is
    /// always kept.
    pub fn with_new_owner(&self, to: ShardId, version: ChunkVersion, at: Timestamp, window_secs: u32) -> Chunk {
        let horizon = at.secs.saturating_sub(window_secs);
        let mut history = vec![ChunkHistory {
            valid_after: at,
            shard: to.clone(),
        }];
        for (i, h) in self.history.iter().enumerate() {
            if i == 0 || h.valid_after.secs >= horizon {
                history.push(h.clone());
            }
        }
        Chunk {
            collection_uuid: self.collection_uuid,
            range: self.range.clone(),
            shard: to,
            version,
            history,
            jumbo: false,
        }
    }

    /// Same owner and history over a different range, as produced by a split.
    pub fn with_range(&self, range: KeyRange, version: ChunkVersion) -> Chunk {
        Chunk {
            collection_uuid: self.collection_uuid,
            range,
            shard: self.shard.clone(),
            version,
            history: self.history.clone(),
            jumbo: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;
    use crate::version::Epoch;

    fn range(lo: i64, hi: i64) -> KeyRange {
        KeyRange::new(
            ShardKey::new(vec![KeyValue::Int(lo)]),
            ShardKey::new(vec![KeyValue::Int(hi)]),
        )
        .unwrap()
    }

    #[test]
    fn new_owner_heads_history() {
        let v = ChunkVersion::new(Epoch::generate(), 1, 0);
        let chunk = Chunk::new(Uuid::new_v4(), range(0, 10), "a".into(), v, Timestamp::new(100, 1));
        let moved = chunk.with_new_owner("b".into(), v.inc_major(), Timestamp::new(200, 1), 50);
        moved.validate().unwrap();
        assert_eq!(moved.shard, ShardId::new("b"));
        assert_eq!(moved.history.len(), 2);
        assert_eq!(moved.shard_at(Timestamp::new(150, 0)), Some(&ShardId::new("a")));
        assert_eq!(moved.shard_at(Timestamp::new(250, 0)), Some(&ShardId::new("b")));
        assert_eq!(moved.shard_at(Timestamp::new(50, 0)), None);

        let again = moved.with_new_owner("c".into(), v.inc_major().inc_major(), Timestamp::new(400, 1), 50);
        // "a" fell out of the window; "b" is kept as the newest prior owner.
        assert_eq!(again.history.len(), 2);
        assert_eq!(again.history[1].shard, ShardId::new("b"));
    }

    #[test]
    fn validate_rejects_mismatched_history() {
        let v = ChunkVersion::new(Epoch::generate(), 1, 0);
        let mut chunk = Chunk::new(Uuid::new_v4(), range(0, 10), "a".into(), v, Timestamp::ZERO);
        chunk.shard = "b".into();
        assert!(matches!(
            chunk.validate(),
            Err(ShardgateError::InconsistentChunkMap(_))
        ));
    }
}
