//! Router-side cursors. A cursor left open after the first batch is parked
//! here under a router cursor id and checked out exclusively by each
//! `getMore`.

use crate::error::{Result, ShardgateError};
use crate::merger::{AsyncResultsMerger, MergerNext};
use crate::namespace::Namespace;
use crate::op_context::OperationContext;
use crate::query::strip_sort_key;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A merged stream plus the router-side skip and limit still to apply.
pub struct ClusterCursor {
    ns: Namespace,
    merger: AsyncResultsMerger,
    skip_remaining: u64,
    limit_remaining: Option<u64>,
    batch_size: Option<u32>,
    tailable: bool,
}

impl ClusterCursor {
    pub fn new(
        ns: Namespace,
        merger: AsyncResultsMerger,
        skip: Option<u64>,
        limit: Option<u64>,
        batch_size: Option<u32>,
        tailable: bool,
    ) -> Self {
        Self {
            ns,
            merger,
            skip_remaining: skip.unwrap_or(0),
            limit_remaining: limit,
            batch_size,
            tailable,
        }
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn is_tailable(&self) -> bool {
        self.tailable
    }

    pub fn batch_size(&self) -> Option<u32> {
        self.batch_size
    }

    pub fn partial_results_returned(&self) -> bool {
        self.merger.partial_results_returned()
    }

    /// Next batch of at most `max` documents with the sort key removed.
    /// Returns `true` once the stream is finished (end of data or limit).
    pub async fn fill_batch(&mut self, ctx: &OperationContext, max: usize) -> Result<(Vec<Value>, bool)> {
        while self.skip_remaining > 0 {
            match self.merger.next(ctx).await? {
                MergerNext::Doc(_) => self.skip_remaining -= 1,
                MergerNext::Eof => return Ok((Vec::new(), true)),
                MergerNext::NotReady => return Ok((Vec::new(), false)),
            }
        }
        let want = match self.limit_remaining {
            Some(limit) => (limit as usize).min(max),
            None => max,
        };
        let mut out = Vec::with_capacity(want.min(1024));
        let mut eof = false;
        while out.len() < want {
            ctx.check_for_interrupt()?;
            match self.merger.next(ctx).await? {
                MergerNext::Doc(mut doc) => {
                    strip_sort_key(&mut doc);
                    out.push(doc);
                }
                MergerNext::Eof => {
                    eof = true;
                    break;
                }
                MergerNext::NotReady => break,
            }
        }
        if let Some(limit) = self.limit_remaining.as_mut() {
            *limit -= out.len() as u64;
            if *limit == 0 {
                eof = true;
            }
        }
        if eof && !self.merger.remotes_exhausted() {
            // Limit reached with remotes still open.
            self.merger.kill();
        }
        Ok((out, eof))
    }

    pub fn kill(&mut self) {
        self.merger.kill();
    }
}

enum Slot {
    Idle(Box<ClusterCursor>),
    CheckedOut { kill_pending: bool },
}

struct Entry {
    ns: Namespace,
    slot: Slot,
    last_used: Instant,
}

#[derive(Default)]
pub struct ClusterCursorManager {
    cursors: Mutex<HashMap<u64, Entry>>,
}

impl ClusterCursorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `cursor` and return its router cursor id, never zero.
    pub fn register(&self, cursor: ClusterCursor) -> u64 {
        let mut cursors = self.cursors.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let id: u64 = rng.gen_range(1..i64::MAX as u64);
            if !cursors.contains_key(&id) {
                break id;
            }
        };
        cursors.insert(
            id,
            Entry {
                ns: cursor.ns.clone(),
                slot: Slot::Idle(Box::new(cursor)),
                last_used: Instant::now(),
            },
        );
        id
    }

    /// Take exclusive ownership of cursor `id` for one `getMore`.
    pub fn check_out(&self, id: u64, ns: &Namespace) -> Result<Box<ClusterCursor>> {
        let mut cursors = self.cursors.lock();
        let entry = cursors.get_mut(&id).ok_or(ShardgateError::CursorNotFound(id))?;
        if &entry.ns != ns {
            return Err(ShardgateError::Unauthorized(format!(
                "cursor {id} belongs to {}, not {ns}",
                entry.ns
            )));
        }
        match std::mem::replace(&mut entry.slot, Slot::CheckedOut { kill_pending: false }) {
            Slot::Idle(cursor) => Ok(cursor),
            busy @ Slot::CheckedOut { .. } => {
                entry.slot = busy;
                Err(ShardgateError::ConflictingOperationInProgress(format!(
                    "cursor {id} is already in use"
                )))
            }
        }
    }

    /// Return a cursor after a `getMore`. Finished cursors and cursors killed
    /// while checked out are dropped instead. Returns whether `id` is still
    /// open.
    pub fn check_in(&self, id: u64, mut cursor: Box<ClusterCursor>, finished: bool) -> bool {
        let mut cursors = self.cursors.lock();
        let kill_pending = matches!(
            cursors.get(&id).map(|e| &e.slot),
            Some(Slot::CheckedOut { kill_pending: true }) | None
        );
        if finished || kill_pending {
            cursors.remove(&id);
            if kill_pending {
                cursor.kill();
            }
            return false;
        }
        match cursors.get_mut(&id) {
            Some(entry) => {
                entry.slot = Slot::Idle(cursor);
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Forget a checked-out cursor whose `getMore` failed.
    pub fn discard(&self, id: u64) {
        self.cursors.lock().remove(&id);
    }

    /// Kill `id`. A checked-out cursor is killed when it is checked in.
    pub fn kill_cursor(&self, id: u64, ns: &Namespace) -> Result<()> {
        let mut cursors = self.cursors.lock();
        let entry = cursors.get_mut(&id).ok_or(ShardgateError::CursorNotFound(id))?;
        if &entry.ns != ns {
            return Err(ShardgateError::CursorNotFound(id));
        }
        let idle = match &mut entry.slot {
            Slot::CheckedOut { kill_pending } => {
                *kill_pending = true;
                false
            }
            Slot::Idle(_) => true,
        };
        if idle {
            if let Some(Entry {
                slot: Slot::Idle(mut cursor),
                ..
            }) = cursors.remove(&id)
            {
                cursor.kill();
            }
        }
        Ok(())
    }

    /// Kill idle cursors unused for longer than `timeout`. Returns how many.
    pub fn kill_idle(&self, timeout: Duration) -> usize {
        let mut cursors = self.cursors.lock();
        let stale: Vec<u64> = cursors
            .iter()
            .filter(|(_, e)| matches!(e.slot, Slot::Idle(_)) && e.last_used.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(Entry {
                slot: Slot::Idle(mut cursor),
                ..
            }) = cursors.remove(id)
            {
                debug!(cursor = id, "reaping idle cursor");
                cursor.kill();
            }
        }
        stale.len()
    }

    pub fn num_open(&self) -> usize {
        self.cursors.lock().len()
    }
}
