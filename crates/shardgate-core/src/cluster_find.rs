use crate::async_sender::AsyncRequest;
use crate::cursor_manager::ClusterCursor;
use crate::error::{Result, ShardgateError};
use crate::establish::establish_cursors;
use crate::merger::{AsyncResultsMerger, MergerParams};
use crate::namespace::Namespace;
use crate::op_context::OperationContext;
use crate::query::{Collation, SortPattern};
use crate::router::Router;
use crate::targeter::ReadPreference;
use crate::transport::{FindCommand, ShardCommand, ShardRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

fn empty_filter() -> Value {
    json!({})
}

/// Client `find` as the router receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindRequest {
    pub ns: Namespace,
    #[serde(default = "empty_filter")]
    pub filter: Value,
    #[serde(default)]
    pub sort: Option<Value>,
    #[serde(default)]
    pub projection: Option<Value>,
    #[serde(default)]
    pub skip: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub collation: Option<Collation>,
    #[serde(default)]
    pub tailable: bool,
    #[serde(default)]
    pub await_data: bool,
    #[serde(default)]
    pub allow_partial_results: bool,
    #[serde(default)]
    pub read_preference: ReadPreference,
}

impl FindRequest {
    pub fn new(ns: Namespace, filter: Value) -> Self {
        Self {
            ns,
            filter,
            sort: None,
            projection: None,
            skip: None,
            limit: None,
            batch_size: None,
            collation: None,
            tailable: false,
            await_data: false,
            allow_partial_results: false,
            read_preference: ReadPreference::PrimaryOnly,
        }
    }

    fn validate(&self) -> Result<Option<SortPattern>> {
        if !self.filter.is_object() {
            return Err(ShardgateError::BadValue(format!(
                "filter must be an object, got {}",
                self.filter
            )));
        }
        if self.await_data && !self.tailable {
            return Err(ShardgateError::BadValue(
                "awaitData requires a tailable cursor".to_string(),
            ));
        }
        if self.tailable {
            if let Some(sort) = &self.sort {
                if sort != &json!({"$clusterTime": 1}) {
                    return Err(ShardgateError::BadValue(format!(
                        "tailable cursors can only be sorted by {{$clusterTime: 1}}, got {sort}"
                    )));
                }
            }
        }
        self.sort.as_ref().map(SortPattern::from_json).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMoreRequest {
    pub ns: Namespace,
    pub cursor_id: u64,
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// Reply to `find` and `getMore`. `cursor_id` is zero once the stream is
/// finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindReply {
    pub cursor_id: u64,
    pub ns: Namespace,
    pub batch: Vec<Value>,
    #[serde(default)]
    pub partial_results_returned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillCursorsReply {
    pub killed: Vec<u64>,
    pub not_found: Vec<u64>,
}

/// Invalidate cached routing after a shard reported `err` as stale.
pub(crate) fn note_stale(router: &Router, err: &ShardgateError) -> bool {
    match err {
        ShardgateError::StaleShardVersion { ns, shard, wanted, .. } => {
            router.routing().on_stale_config(ns, *wanted, Some(shard))
        }
        ShardgateError::StaleEpoch { ns, wanted, .. } => router.routing().on_stale_config(ns, *wanted, None),
        _ => false,
    }
}

pub struct ClusterFind;

impl ClusterFind {
    /// Run a query against every shard that may hold matching documents and
    /// return the first batch. Stale routing restarts the whole operation
    /// with refreshed metadata, up to the read retry budget.
    pub async fn find(router: &Router, ctx: &OperationContext, request: FindRequest) -> Result<FindReply> {
        let sort = request.validate()?;
        let budget = router.params().read_stale_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check_for_interrupt()?;
            match Self::try_find(router, ctx, &request, sort.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_stale_routing() && attempt < budget => {
                    note_stale(router, &e);
                    debug!(ns = %request.ns, attempt, error = %e, "retrying find after stale routing");
                }
                Err(e) => {
                    if e.is_stale_routing() {
                        info!(ns = %request.ns, attempts = attempt, "find gave up on stale routing");
                        note_stale(router, &e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn try_find(
        router: &Router,
        ctx: &OperationContext,
        request: &FindRequest,
        sort: Option<SortPattern>,
    ) -> Result<FindReply> {
        let ns = &request.ns;
        let info = router.routing().get_routing_info(ns).await?;
        let shards = info.target_shards(ns, &request.filter, request.collation.as_ref())?;
        router.ensure_shards_known(shards.iter()).await?;

        // Shards cannot skip for us, so each returns up to skip + limit.
        let command = FindCommand {
            filter: request.filter.clone(),
            sort: request.sort.clone(),
            projection: request.projection.clone(),
            batch_size: request.batch_size,
            limit: request.limit.map(|l| l + request.skip.unwrap_or(0)),
            collation: request.collation.clone(),
            tailable: request.tailable,
            await_data: request.await_data,
        };
        let requests = shards
            .iter()
            .map(|shard| AsyncRequest {
                shard: shard.clone(),
                request: ShardRequest::versioned(
                    ns.clone(),
                    info.version_for(shard),
                    ShardCommand::Find(command.clone()),
                ),
            })
            .collect();
        let established = establish_cursors(
            router.client(),
            ctx,
            requests,
            request.read_preference,
            request.allow_partial_results,
        )
        .await?;
        let skipped = established.is_partial();

        let params = router.params();
        let merger = AsyncResultsMerger::new(
            router.client().clone(),
            MergerParams {
                ns: ns.clone(),
                sort,
                tailable: request.tailable,
                await_data: request.await_data,
                batch_size: request.batch_size,
                allow_partial_results: request.allow_partial_results,
                default_batch_size: params.default_batch_size,
                max_buffered_per_remote: params.max_buffered_per_remote,
                await_data_timeout: params.await_data_timeout,
            },
            established.remotes,
        );
        let mut cursor = ClusterCursor::new(
            ns.clone(),
            merger,
            request.skip,
            request.limit,
            request.batch_size,
            request.tailable,
        );
        let max = request.batch_size.unwrap_or(params.default_batch_size) as usize;
        let (batch, finished) = cursor.fill_batch(ctx, max).await?;
        let partial_results_returned = skipped || cursor.partial_results_returned();
        let cursor_id = if finished {
            0
        } else {
            router.cursors().register(cursor)
        };
        Ok(FindReply {
            cursor_id,
            ns: ns.clone(),
            batch,
            partial_results_returned,
        })
    }

    pub async fn get_more(router: &Router, ctx: &OperationContext, request: GetMoreRequest) -> Result<FindReply> {
        let id = request.cursor_id;
        let mut cursor = router.cursors().check_out(id, &request.ns)?;
        let max = request
            .batch_size
            .or(cursor.batch_size())
            .unwrap_or(router.params().default_batch_size) as usize;
        match cursor.fill_batch(ctx, max).await {
            Ok((batch, finished)) => {
                let partial_results_returned = cursor.partial_results_returned();
                let open = router.cursors().check_in(id, cursor, finished);
                Ok(FindReply {
                    cursor_id: if open { id } else { 0 },
                    ns: request.ns,
                    batch,
                    partial_results_returned,
                })
            }
            Err(e) => {
                debug!(cursor = id, error = %e, "getMore failed, closing cursor");
                router.cursors().discard(id);
                Err(e)
            }
        }
    }

    pub fn kill_cursors(router: &Router, ns: &Namespace, cursor_ids: &[u64]) -> KillCursorsReply {
        let mut reply = KillCursorsReply::default();
        for &id in cursor_ids {
            match router.cursors().kill_cursor(id, ns) {
                Ok(()) => reply.killed.push(id),
                Err(_) => reply.not_found.push(id),
            }
        }
        reply
    }
}
