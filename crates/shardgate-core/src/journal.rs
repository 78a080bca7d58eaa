use crate::catalog::{
    CollectionEntry, DatabaseEntry, LockDocument, MigrationDocument, RangeDeletionTask, ShardEntry, TagRange,
};
use crate::chunk::Chunk;
use crate::clock::Timestamp;
use crate::error::Result;
use crate::key::ShardKey;
use crate::namespace::{Namespace, ShardId};
use crate::version::Epoch;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One catalog mutation. Replaying every record in order rebuilds the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatalogRecord {
    PutDatabase(DatabaseEntry),
    PutCollection(CollectionEntry),
    CommitChunks {
        ns: Namespace,
        remove: Vec<ShardKey>,
        upsert: Vec<Chunk>,
    },
    ReplaceCollection {
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
        tags: Vec<TagRange>,
    },
    DropCollection {
        ns: Namespace,
        at: Timestamp,
    },
    RenameCollection {
        from: Namespace,
        to: Namespace,
        epoch: Epoch,
        at: Timestamp,
    },
    PutShard(ShardEntry),
    RemoveShard(ShardId),
    PutTag(TagRange),
    RemoveTag {
        ns: Namespace,
        min: ShardKey,
    },
    PutLock(LockDocument),
    RemoveLock(String),
    PutMigration(MigrationDocument),
    RemoveMigration(Uuid),
    PutRangeDeletion(RangeDeletionTask),
    RemoveRangeDeletion(Uuid),
}

/// Append-only file of length-prefixed bincode records.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Open or create the journal in `dir`. A torn trailing record left by
    /// a crash is cut off so new records never land behind it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.as_ref().join("catalog.journal");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let (_, valid) = Self::scan(&path)?;
        let len = file.metadata()?.len();
        if len > valid {
            tracing::warn!(path = %path.display(), torn = len - valid, "truncating torn journal tail");
            file.set_len(valid)?;
            file.sync_all()?;
        }
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn write_record(writer: &mut BufWriter<File>, record: &CatalogRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Append and flush one record; the catalog applies it only afterwards.
    pub fn append(&mut self, record: &CatalogRecord) -> Result<()> {
        Self::write_record(&mut self.writer, record)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Every complete record in the file. A torn trailing record is ignored.
    pub fn replay(&self) -> Result<Vec<CatalogRecord>> {
        Ok(Self::scan(&self.path)?.0)
    }

    /// Complete records and the byte offset just past the last of them.
    fn scan(path: &Path) -> Result<(Vec<CatalogRecord>, u64)> {
        let file = OpenOptions::new().read(true).open(path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            if let Err(e) = reader.read_exact(&mut len_buf) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(e.into());
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut data = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut data) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    tracing::warn!(path = %path.display(), "ignoring torn journal tail");
                    break;
                }
                return Err(e.into());
            }
            records.push(bincode::deserialize(&data)?);
            valid += 4 + len as u64;
        }
        Ok((records, valid))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Atomically replace the journal with `records`, e.g. a snapshot of the
    /// current catalog state.
    pub fn rewrite(&mut self, records: &[CatalogRecord]) -> Result<()> {
        let tmp = self.path.with_extension("journal.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for record in records {
                Self::write_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionString;

    fn shard(id: &str) -> CatalogRecord {
        CatalogRecord::PutShard(ShardEntry {
            id: id.into(),
            connection_string: ConnectionString::parse(&format!("{id}:1")).unwrap(),
            max_size_bytes: 0,
            draining: false,
        })
    }

    #[test]
    fn replays_appended_records_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut j = Journal::open(dir.path())?;
            j.append(&shard("a"))?;
            j.append(&shard("b"))?;
            j.append(&CatalogRecord::RemoveShard("a".into()))?;
            j.sync()?;
        }
        let j = Journal::open(dir.path())?;
        let records = j.replay()?;
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[2], CatalogRecord::RemoveShard(id) if id.as_str() == "a"));
        Ok(())
    }

    #[test]
    fn rewrite_replaces_contents_and_ignores_torn_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut j = Journal::open(dir.path())?;
        j.append(&shard("a"))?;
        j.append(&shard("b"))?;
        j.rewrite(&[shard("c")])?;
        j.append(&shard("d"))?;
        assert_eq!(j.replay()?.len(), 2);

        // Simulate a crash halfway through a record.
        let path = dir.path().join("catalog.journal");
        let mut f = OpenOptions::new().append(true).open(&path)?;
        f.write_all(&100u32.to_le_bytes())?;
        f.write_all(&[1, 2, 3])?;
        drop(f);
        let torn_len = std::fs::metadata(&path)?.len();

        let mut reopened = Journal::open(dir.path())?;
        assert!(reopened.len()? < torn_len);
        assert_eq!(reopened.replay()?.len(), 2);
        reopened.append(&shard("e"))?;
        reopened.append(&shard("f"))?;
        reopened.sync()?;
        drop(reopened);

        let records = Journal::open(dir.path())?.replay()?;
        assert_eq!(records.len(), 4);
        assert!(matches!(&records[3], CatalogRecord::PutShard(s) if s.id.as_str() == "f"));
        Ok(())
    }
}
