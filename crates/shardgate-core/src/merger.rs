//! Merging cursor engine: combines the streams of several remote cursors
//! into one, unsorted (round-robin over whatever is buffered) or sorted on
//! `$sortKey`. Sorted tailable streams additionally track each remote's
//! high-water mark so that a document is only released once no remote can
//! still produce something that sorts before it.

use crate::async_sender::ShardClient;
use crate::clock::Timestamp;
use crate::error::{Result, ShardgateError};
use crate::namespace::{Namespace, ShardId};
use crate::op_context::OperationContext;
use crate::query::{SortPattern, SORT_KEY_FIELD};
use crate::registry::HostAndPort;
use crate::targeter::HostObservation;
use crate::transport::{CursorBatch, ShardCommand, ShardRequest};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A cursor opened on one shard, handed to exactly one merger.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub shard_id: ShardId,
    pub host: HostAndPort,
    pub cursor_id: u64,
    pub namespace: Namespace,
    pub batch: Vec<Value>,
    pub post_batch_resume_token: Option<Timestamp>,
}

impl RemoteCursor {
    pub fn from_batch(shard_id: ShardId, host: HostAndPort, batch: CursorBatch) -> Self {
        Self {
            shard_id,
            host,
            cursor_id: batch.cursor_id,
            namespace: batch.ns,
            batch: batch.batch,
            post_batch_resume_token: batch.post_batch_resume_token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Open, nothing buffered and nothing requested.
    Init,
    AwaitingBatch,
    HasBuffer,
    Exhausted,
    Error,
    KillRequested,
    Killed,
}

#[derive(Debug, Clone)]
pub struct MergerParams {
    pub ns: Namespace,
    /// Sort applied to each document's `$sortKey`.
    pub sort: Option<SortPattern>,
    pub tailable: bool,
    pub await_data: bool,
    pub batch_size: Option<u32>,
    pub allow_partial_results: bool,
    pub default_batch_size: u32,
    pub max_buffered_per_remote: usize,
    pub await_data_timeout: Duration,
}

/// Outcome of one `next()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum MergerNext {
    Doc(Value),
    Eof,
    /// Tailable only: nothing can be emitted right now, but the stream is
    /// still open.
    NotReady,
}

struct Remote {
    shard_id: ShardId,
    host: HostAndPort,
    cursor_id: u64,
    ns: Namespace,
    buffer: VecDeque<Value>,
    state: RemoteState,
    in_flight: bool,
    /// Tailable only: returned an empty batch during the current `next()`.
    idle: bool,
    hwm: Option<Timestamp>,
}

impl Remote {
    fn from_cursor(cursor: RemoteCursor) -> Self {
        let mut remote = Self {
            shard_id: cursor.shard_id,
            host: cursor.host,
            cursor_id: cursor.cursor_id,
            ns: cursor.namespace,
            buffer: cursor.batch.into(),
            state: RemoteState::Init,
            in_flight: false,
            idle: false,
            hwm: cursor.post_batch_resume_token,
        };
        remote.settle();
        remote
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RemoteState::Error | RemoteState::KillRequested | RemoteState::Killed
        )
    }

    /// Recompute the state from buffer and cursor, unless terminal.
    fn settle(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = if self.in_flight {
            RemoteState::AwaitingBatch
        } else if !self.buffer.is_empty() {
            RemoteState::HasBuffer
        } else if self.cursor_id == 0 {
            RemoteState::Exhausted
        } else {
            RemoteState::Init
        };
    }

    fn needs_fetch(&self) -> bool {
        !self.is_terminal() && !self.in_flight && !self.idle && self.buffer.is_empty() && self.cursor_id != 0
    }

    /// Still able to produce documents.
    fn is_live(&self) -> bool {
        !self.is_terminal() && (self.cursor_id != 0 || self.in_flight)
    }
}

struct HeapEntry {
    key: Value,
    remote: usize,
    sort: Arc<SortPattern>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed: BinaryHeap is a max-heap and the smallest key goes first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort
            .compare_sort_keys(&other.key, &self.key)
            .then_with(|| other.remote.cmp(&self.remote))
    }
}

type Reply = (usize, Result<CursorBatch>);

pub struct AsyncResultsMerger {
    client: ShardClient,
    params: MergerParams,
    sort: Option<Arc<SortPattern>>,
    remotes: Vec<Remote>,
    heap: BinaryHeap<HeapEntry>,
    tx: mpsc::UnboundedSender<Reply>,
    rx: Option<mpsc::UnboundedReceiver<Reply>>,
    next_remote: usize,
    partial: bool,
    fatal: Option<ShardgateError>,
    kill_event: Option<CancellationToken>,
}

impl AsyncResultsMerger {
    pub fn new(client: ShardClient, params: MergerParams, remotes: Vec<RemoteCursor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sort = params.sort.clone().map(Arc::new);
        let mut merger = Self {
            client,
            params,
            sort,
            remotes: Vec::new(),
            heap: BinaryHeap::new(),
            tx,
            rx: Some(rx),
            next_remote: 0,
            partial: false,
            fatal: None,
            kill_event: None,
        };
        merger.add_remotes(remotes);
        merger
    }

    /// Add cursors to a running stream. In sorted tailable mode a remote
    /// without a high-water mark holds back every document until it
    /// reports one.
    pub fn add_remotes(&mut self, cursors: Vec<RemoteCursor>) {
        for cursor in cursors {
            let idx = self.remotes.len();
            self.remotes.push(Remote::from_cursor(cursor));
            self.push_head(idx);
        }
    }

    pub fn params(&self) -> &MergerParams {
        &self.params
    }

    pub fn num_remotes(&self) -> usize {
        self.remotes.len()
    }

    pub fn remote_states(&self) -> Vec<(ShardId, RemoteState)> {
        let killed = self.kill_event.as_ref().map(|e| e.is_cancelled()).unwrap_or(false);
        self.remotes
            .iter()
            .map(|r| {
                let state = match r.state {
                    RemoteState::KillRequested if killed => RemoteState::Killed,
                    s => s,
                };
                (r.shard_id.clone(), state)
            })
            .collect()
    }

    /// No remote can produce further documents.
    pub fn remotes_exhausted(&self) -> bool {
        self.remotes.iter().all(|r| !r.is_live())
    }

    pub fn partial_results_returned(&self) -> bool {
        self.partial
    }

    pub fn is_killed(&self) -> bool {
        self.kill_event.is_some()
    }

    fn push_head(&mut self, idx: usize) {
        let (Some(sort), Some(head)) = (&self.sort, self.remotes[idx].buffer.front()) else {
            return;
        };
        self.heap.push(HeapEntry {
            key: head.get(SORT_KEY_FIELD).cloned().unwrap_or(Value::Null),
            remote: idx,
            sort: sort.clone(),
        });
    }

    fn pop_from(&mut self, idx: usize) -> Option<Value> {
        let remote = &mut self.remotes[idx];
        let doc = remote.buffer.pop_front()?;
        remote.settle();
        Some(doc)
    }

    fn take_ready(&mut self) -> Option<Value> {
        let Some(sort) = self.sort.clone() else {
            let n = self.remotes.len();
            for step in 0..n {
                let idx = (self.next_remote + step) % n;
                if !self.remotes[idx].buffer.is_empty() {
                    self.next_remote = idx + 1;
                    return self.pop_from(idx);
                }
            }
            return None;
        };

        let head = self.heap.peek()?;
        for remote in self.remotes.iter().filter(|r| r.buffer.is_empty() && r.is_live()) {
            if !self.params.tailable {
                // Blocking rule: every open remote must show its next key.
                return None;
            }
            let hwm = remote.hwm?;
            let virtual_key = json!([hwm.as_u64()]);
            if sort.compare_sort_keys(&head.key, &virtual_key) == Ordering::Greater {
                return None;
            }
        }
        let idx = self.heap.pop()?.remote;
        let doc = self.pop_from(idx);
        self.push_head(idx);
        doc
    }

    fn at_eof(&self) -> bool {
        self.remotes
            .iter()
            .all(|r| r.buffer.is_empty() && !r.is_live())
    }

    fn schedule_get_mores(&mut self, ctx: &OperationContext) {
        let batch_size = self
            .params
            .batch_size
            .unwrap_or(self.params.default_batch_size)
            .min(self.params.max_buffered_per_remote.max(1) as u32)
            .max(1);
        let max_time_ms = (self.params.tailable && self.params.await_data)
            .then(|| self.params.await_data_timeout.as_millis() as u64);
        let deadline = ctx
            .deadline_or(self.client.params().default_op_timeout)
            .max(Instant::now() + self.params.await_data_timeout * 2);
        for (idx, remote) in self.remotes.iter_mut().enumerate() {
            if !remote.needs_fetch() {
                continue;
            }
            remote.in_flight = true;
            remote.settle();
            let request = ShardRequest::new(
                remote.ns.clone(),
                ShardCommand::GetMore {
                    cursor_id: remote.cursor_id,
                    batch_size: Some(batch_size),
                    max_time_ms,
                },
            );
            let client = self.client.clone();
            let tx = self.tx.clone();
            let host = remote.host.clone();
            let shard = remote.shard_id.clone();
            tokio::spawn(async move {
                let result = client
                    .send_to_host(&host, request, deadline)
                    .await
                    .and_then(|r| r.into_cursor());
                if let Err(e) = &result {
                    if e.is_retriable_network() {
                        if let Ok(target) = client.registry().get_shard(&shard) {
                            target.targeter().on_response(&host, HostObservation::NetworkError);
                        }
                    }
                }
                let _ = tx.send((idx, result));
            });
        }
    }

    fn on_reply(&mut self, idx: usize, result: Result<CursorBatch>) -> Result<()> {
        let tailable = self.params.tailable;
        let remote = &mut self.remotes[idx];
        remote.in_flight = false;
        match result {
            Ok(batch) => {
                remote.cursor_id = batch.cursor_id;
                if let Some(token) = batch.post_batch_resume_token {
                    remote.hwm = Some(remote.hwm.map_or(token, |h| h.max(token)));
                }
                if tailable && batch.batch.is_empty() {
                    remote.idle = true;
                }
                let was_empty = remote.buffer.is_empty();
                remote.buffer.extend(batch.batch);
                remote.settle();
                if was_empty {
                    self.push_head(idx);
                }
                Ok(())
            }
            Err(e) => {
                remote.cursor_id = 0;
                remote.state = RemoteState::Error;
                let fatal = match e {
                    ShardgateError::StaleEpoch { ns, .. } => Some(ShardgateError::QueryPlanKilled(format!(
                        "collection {ns} was dropped or recreated while the cursor was open"
                    ))),
                    e if e.is_stale_routing() || !self.params.allow_partial_results => Some(e),
                    e => {
                        warn!(shard = %remote.shard_id, error = %e, "dropping failed remote, returning partial results");
                        self.partial = true;
                        None
                    }
                };
                match fatal {
                    Some(e) => {
                        self.fatal = Some(e.clone());
                        Err(e)
                    }
                    None => Ok(()),
                }
            }
        }
    }

    pub async fn next(&mut self, ctx: &OperationContext) -> Result<MergerNext> {
        for remote in self.remotes.iter_mut() {
            remote.idle = false;
        }
        loop {
            if self.kill_event.is_some() {
                return Err(ShardgateError::CursorKilled);
            }
            if let Some(e) = &self.fatal {
                return Err(e.clone());
            }
            if let Some(doc) = self.take_ready() {
                return Ok(MergerNext::Doc(doc));
            }
            if self.at_eof() {
                return Ok(MergerNext::Eof);
            }
            self.schedule_get_mores(ctx);
            if self.params.tailable && !self.remotes.iter().any(|r| r.in_flight) {
                return Ok(MergerNext::NotReady);
            }

            let Some(rx) = self.rx.as_mut() else {
                return Err(ShardgateError::CursorKilled);
            };
            let deadline = ctx.deadline();
            let reply = tokio::select! {
                _ = ctx.cancel_token().cancelled() => return Err(ShardgateError::Interrupted),
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => return Err(ShardgateError::ExceededTimeLimit),
                reply = rx.recv() => reply,
            };
            let (idx, result) =
                reply.ok_or_else(|| ShardgateError::Internal("merger reply channel closed".to_string()))?;
            self.on_reply(idx, result)?;
        }
    }

    /// Up to `n` documents, stopping early at end of stream or, for tailable
    /// streams, when nothing is ready. The flag reports end of stream.
    pub async fn next_batch(&mut self, ctx: &OperationContext, n: usize) -> Result<(Vec<Value>, bool)> {
        let mut out = Vec::with_capacity(n.min(1024));
        while out.len() < n {
            match self.next(ctx).await? {
                MergerNext::Doc(doc) => out.push(doc),
                MergerNext::Eof => return Ok((out, true)),
                MergerNext::NotReady => break,
            }
        }
        Ok((out, false))
    }

    /// Stop the stream. Remotes still open get `killCursors` once their
    /// outstanding requests have come back; the returned token fires when
    /// that is done. Calling again returns the same token.
    pub fn kill(&mut self) -> CancellationToken {
        if let Some(event) = &self.kill_event {
            return event.clone();
        }
        let event = CancellationToken::new();
        self.kill_event = Some(event.clone());
        self.heap.clear();

        let mut to_kill: Vec<(HostAndPort, Namespace, u64)> = Vec::new();
        let mut outstanding: BTreeMap<usize, (HostAndPort, Namespace)> = BTreeMap::new();
        for (idx, remote) in self.remotes.iter_mut().enumerate() {
            remote.buffer.clear();
            if !remote.is_live() {
                continue;
            }
            if remote.in_flight {
                outstanding.insert(idx, (remote.host.clone(), remote.ns.clone()));
            } else {
                to_kill.push((remote.host.clone(), remote.ns.clone(), remote.cursor_id));
            }
            remote.state = RemoteState::KillRequested;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            event.cancel();
            return event;
        };
        let rx = self.rx.take();
        let client = self.client.clone();
        let done = event.clone();
        runtime.spawn(async move {
            if let Some(mut rx) = rx {
                while !outstanding.is_empty() {
                    let Some((idx, result)) = rx.recv().await else {
                        break;
                    };
                    if let (Some((host, ns)), Ok(batch)) = (outstanding.remove(&idx), result) {
                        if batch.cursor_id != 0 {
                            to_kill.push((host, ns, batch.cursor_id));
                        }
                    }
                }
            }
            kill_remote_cursors(&client, to_kill).await;
            done.cancel();
        });
        event
    }
}

/// Send `killCursors` for each `(host, ns, cursor id)`, one request per
/// host and namespace. Failures are logged; the shard reaps the cursor
/// eventually.
pub(crate) async fn kill_remote_cursors(client: &ShardClient, cursors: Vec<(HostAndPort, Namespace, u64)>) {
    let mut by_host: BTreeMap<(HostAndPort, Namespace), Vec<u64>> = BTreeMap::new();
    for (host, ns, id) in cursors {
        by_host.entry((host, ns)).or_default().push(id);
    }
    let deadline = Instant::now() + client.params().default_op_timeout;
    for ((host, ns), cursor_ids) in by_host {
        debug!(%host, %ns, cursors = ?cursor_ids, "killing remote cursors");
        let request = ShardRequest::new(ns, ShardCommand::KillCursors { cursor_ids });
        if let Err(e) = client.send_to_host(&host, request, deadline).await {
            warn!(%host, error = %e, "killCursors failed");
        }
    }
}

impl Drop for AsyncResultsMerger {
    fn drop(&mut self) {
        if self.kill_event.is_none() && self.remotes.iter().any(|r| r.is_live()) {
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterParams;
    use crate::pool::ConnectionPools;
    use crate::registry::{ConnectionString, ShardRegistry};
    use crate::transport::{ShardResponse, ShardTransport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Replies to getMore from a per-host script; records killCursors.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<HashMap<HostAndPort, VecDeque<Result<ShardResponse>>>>,
        killed: Mutex<Vec<(HostAndPort, Vec<u64>)>>,
    }

    impl Scripted {
        fn push(&self, host: &HostAndPort, reply: Result<ShardResponse>) {
            self.replies.lock().entry(host.clone()).or_default().push_back(reply);
        }
    }

    #[async_trait]
    impl ShardTransport for Scripted {
        async fn send(&self, host: &HostAndPort, request: ShardRequest) -> Result<ShardResponse> {
            if let ShardCommand::KillCursors { cursor_ids } = request.command {
                self.killed.lock().push((host.clone(), cursor_ids));
                return Ok(ShardResponse::Ok);
            }
            let next = self.replies.lock().get_mut(host).and_then(|q| q.pop_front());
            next.unwrap_or_else(|| Err(ShardgateError::CursorNotFound(0)))
        }
    }

    fn ns() -> Namespace {
        Namespace::new("db", "c")
    }

    fn client(transport: Arc<Scripted>) -> ShardClient {
        let params = ClusterParams::for_tests();
        ShardClient::new(
            Arc::new(ShardRegistry::new(ConnectionString::parse("cfg:1").unwrap(), params.host_cooldown)),
            transport,
            Arc::new(ConnectionPools::new(4)),
            Arc::new(params),
        )
    }

    fn params(sort: Option<Value>, tailable: bool, partial: bool) -> MergerParams {
        MergerParams {
            ns: ns(),
            sort: sort.map(|s| SortPattern::from_json(&s).unwrap()),
            tailable,
            await_data: tailable,
            batch_size: None,
            allow_partial_results: partial,
            default_batch_size: 101,
            max_buffered_per_remote: 1000,
            await_data_timeout: Duration::from_millis(10),
        }
    }

    fn remote(shard: &str, cursor_id: u64, batch: Vec<Value>) -> RemoteCursor {
        RemoteCursor {
            shard_id: shard.into(),
            host: HostAndPort::new(shard, 1),
            cursor_id,
            namespace: ns(),
            batch,
            post_batch_resume_token: None,
        }
    }

    fn batch(cursor_id: u64, docs: Vec<Value>, token: Option<Timestamp>) -> Result<ShardResponse> {
        Ok(ShardResponse::Cursor(CursorBatch {
            cursor_id,
            ns: ns(),
            batch: docs,
            post_batch_resume_token: token,
        }))
    }

    async fn drain(merger: &mut AsyncResultsMerger) -> Result<Vec<Value>> {
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let mut out = Vec::new();
        loop {
            match merger.next(&ctx).await? {
                MergerNext::Doc(d) => out.push(d),
                MergerNext::Eof => return Ok(out),
                MergerNext::NotReady => panic!("not tailable"),
            }
        }
    }

    #[tokio::test]
    async fn single_exhausted_remote_streams_in_order() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        let docs = vec![json!({"_id": 1}), json!({"_id": 2}), json!({"_id": 3})];
        let mut merger = AsyncResultsMerger::new(
            client(transport),
            params(None, false, false),
            vec![remote("a", 0, docs.clone())],
        );
        assert_eq!(drain(&mut merger).await?, docs);
        assert!(merger.remotes_exhausted());
        assert_eq!(merger.remote_states()[0].1, RemoteState::Exhausted);
        Ok(())
    }

    fn keyed(k: i64) -> Value {
        json!({"k": k, "$sortKey": [k]})
    }

    #[tokio::test]
    async fn sorted_merge_interleaves_remotes() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        let mut merger = AsyncResultsMerger::new(
            client(transport),
            params(Some(json!({"k": 1})), false, false),
            vec![
                remote("a", 0, vec![keyed(5), keyed(6)]),
                remote("b", 0, vec![keyed(3), keyed(9)]),
            ],
        );
        let keys: Vec<i64> = drain(&mut merger)
            .await?
            .iter()
            .filter_map(|d| d["k"].as_i64())
            .collect();
        assert_eq!(keys, vec![3, 5, 6, 9]);
        Ok(())
    }

    #[tokio::test]
    async fn sorted_merge_waits_for_every_open_remote() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        transport.push(&HostAndPort::new("b", 1), batch(0, vec![keyed(1), keyed(8)], None));
        let mut merger = AsyncResultsMerger::new(
            client(transport.clone()),
            params(Some(json!({"k": 1})), false, false),
            vec![remote("a", 0, vec![keyed(2), keyed(4)]), remote("b", 7, vec![])],
        );
        let keys: Vec<i64> = drain(&mut merger)
            .await?
            .iter()
            .filter_map(|d| d["k"].as_i64())
            .collect();
        assert_eq!(keys, vec![1, 2, 4, 8]);
        Ok(())
    }

    #[tokio::test]
    async fn partial_results_skip_failed_remotes() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        transport.push(
            &HostAndPort::new("a", 1),
            Err(ShardgateError::HostUnreachable("a:1".into())),
        );
        let mut merger = AsyncResultsMerger::new(
            client(transport.clone()),
            params(None, false, true),
            vec![remote("a", 11, vec![json!({"_id": 1})]), remote("b", 0, vec![json!({"_id": 2})])],
        );
        let mut ids: Vec<i64> = drain(&mut merger)
            .await?
            .iter()
            .filter_map(|d| d["_id"].as_i64())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(merger.partial_results_returned());
        assert!(merger.remotes_exhausted());

        // Without the flag the same failure is fatal.
        transport.push(
            &HostAndPort::new("a", 1),
            Err(ShardgateError::HostUnreachable("a:1".into())),
        );
        let mut strict = AsyncResultsMerger::new(
            client(transport),
            params(None, false, false),
            vec![remote("a", 11, vec![])],
        );
        assert!(matches!(
            drain(&mut strict).await,
            Err(ShardgateError::HostUnreachable(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stale_epoch_kills_the_stream() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        transport.push(
            &HostAndPort::new("a", 1),
            Err(ShardgateError::StaleEpoch {
                ns: ns(),
                received: crate::version::ChunkVersion::UNSHARDED,
                wanted: None,
            }),
        );
        let mut merger = AsyncResultsMerger::new(
            client(transport),
            params(None, false, true),
            vec![remote("a", 3, vec![])],
        );
        let err = drain(&mut merger).await.unwrap_err();
        assert!(matches!(err, ShardgateError::QueryPlanKilled(_)));
        assert!(!merger.partial_results_returned());
        Ok(())
    }

    fn tailing(shard: &str, token: Option<Timestamp>) -> RemoteCursor {
        RemoteCursor {
            post_batch_resume_token: token,
            ..remote(shard, 5, vec![])
        }
    }

    fn at(ts: Timestamp) -> Value {
        json!({"ts": ts.as_u64(), "$sortKey": [ts.as_u64()]})
    }

    #[tokio::test]
    async fn tailable_merge_respects_high_water_marks() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        let (a, b) = (HostAndPort::new("a", 1), HostAndPort::new("b", 1));
        let t = |s| Timestamp::new(s, 0);
        transport.push(&a, batch(5, vec![at(t(10)), at(t(30))], Some(t(30))));
        transport.push(&b, batch(5, vec![], Some(t(20))));

        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let mut merger = AsyncResultsMerger::new(
            client(transport.clone()),
            params(Some(json!({"$clusterTime": 1})), true, false),
            vec![tailing("a", Some(t(1))), tailing("b", Some(t(1)))],
        );
        // b has promised nothing past 20, so only the document at 10 is safe.
        let (docs, eof) = merger.next_batch(&ctx, 10).await?;
        assert!(!eof);
        assert_eq!(docs, vec![at(t(10))]);

        transport.push(&b, batch(5, vec![at(t(25))], Some(t(40))));
        transport.push(&a, batch(5, vec![], Some(t(30))));
        transport.push(&b, batch(5, vec![], Some(t(40))));
        let (docs, _) = merger.next_batch(&ctx, 10).await?;
        assert_eq!(docs, vec![at(t(25)), at(t(30))]);
        Ok(())
    }

    #[tokio::test]
    async fn remote_added_without_mark_freezes_emission() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        let t = |s| Timestamp::new(s, 0);
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let mut merger = AsyncResultsMerger::new(
            client(transport.clone()),
            params(Some(json!({"$clusterTime": 1})), true, false),
            vec![RemoteCursor {
                batch: vec![at(t(10))],
                ..tailing("a", Some(t(10)))
            }],
        );
        merger.add_remotes(vec![tailing("c", None)]);
        transport.push(&HostAndPort::new("c", 1), batch(5, vec![], None));
        assert_eq!(merger.next(&ctx).await?, MergerNext::NotReady);

        transport.push(&HostAndPort::new("c", 1), batch(5, vec![], Some(t(15))));
        assert_eq!(merger.next(&ctx).await?, MergerNext::Doc(at(t(10))));
        Ok(())
    }

    #[tokio::test]
    async fn kill_waits_for_outstanding_requests() -> Result<()> {
        let transport = Arc::new(Scripted::default());
        let mut merger = AsyncResultsMerger::new(
            client(transport.clone()),
            params(None, false, false),
            vec![remote("a", 21, vec![json!({"_id": 1})]), remote("b", 22, vec![]), remote("c", 0, vec![])],
        );
        let event = merger.kill();
        tokio::time::timeout(Duration::from_secs(2), event.cancelled())
            .await
            .expect("kill completes");
        assert!(merger.kill().is_cancelled());
        let mut killed = transport.killed.lock().clone();
        killed.sort();
        assert_eq!(
            killed,
            vec![(HostAndPort::new("a", 1), vec![21]), (HostAndPort::new("b", 1), vec![22])]
        );
        let ctx = OperationContext::new();
        assert_eq!(merger.next(&ctx).await, Err(ShardgateError::CursorKilled));
        assert!(merger
            .remote_states()
            .iter()
            .all(|(_, s)| matches!(s, RemoteState::Killed | RemoteState::Exhausted)));
        Ok(())
    }
}
