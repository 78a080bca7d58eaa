use crate::async_sender::{AsyncRequest, AsyncRequestsSender, RetryPolicy};
use crate::cluster_find::note_stale;
use crate::error::{ErrorCode, Result, ShardgateError};
use crate::namespace::{Namespace, ShardId};
use crate::op_context::OperationContext;
use crate::router::Router;
use crate::routing_cache::RoutingInfo;
use crate::targeter::ReadPreference;
use crate::transport::{ShardCommand, ShardRequest, ShardResponse};
use crate::version::ChunkVersion;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteError {
    /// Position of the document in the request.
    pub index: usize,
    pub code: ErrorCode,
    pub error: ShardgateError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertReply {
    pub n: u64,
    #[serde(default)]
    pub write_errors: Vec<WriteError>,
}

impl InsertReply {
    fn fail(&mut self, docs: &[(usize, Value)], error: &ShardgateError) {
        self.write_errors.extend(docs.iter().map(|(index, _)| WriteError {
            index: *index,
            code: error.code(),
            error: error.clone(),
        }));
    }
}

pub struct ClusterWriter;

impl ClusterWriter {
    /// Unordered insert. Each document goes to the shard owning its key;
    /// batches rejected as stale are re-targeted with refreshed routing, up
    /// to the write retry budget. Only not-master failures are retried at the
    /// network level, since an insert may have been applied before a
    /// connection broke.
    pub async fn insert(
        router: &Router,
        ctx: &OperationContext,
        ns: &Namespace,
        documents: Vec<Value>,
    ) -> Result<InsertReply> {
        let mut reply = InsertReply::default();
        let mut pending: Vec<(usize, Value)> = Vec::with_capacity(documents.len());
        for (index, mut doc) in documents.into_iter().enumerate() {
            match doc.as_object_mut() {
                Some(obj) => {
                    // Assigned here so a retried batch cannot insert twice
                    // under two generated ids.
                    obj.entry("_id").or_insert_with(|| json!(Uuid::new_v4().to_string()));
                    pending.push((index, doc));
                }
                None => reply.fail(
                    &[(index, doc.clone())],
                    &ShardgateError::BadValue(format!("document must be an object, got {doc}")),
                ),
            }
        }

        let budget = router.params().write_stale_retries.max(1);
        let mut attempt = 0;
        while !pending.is_empty() {
            attempt += 1;
            ctx.check_for_interrupt()?;
            let info = match router.routing().get_routing_info(ns).await? {
                RoutingInfo::Dropped => RoutingInfo::Unsharded {
                    primary: router.routing().get_database(&ns.db).await?.primary,
                },
                info => info,
            };

            let mut groups: BTreeMap<ShardId, Vec<(usize, Value)>> = BTreeMap::new();
            for (index, doc) in pending.drain(..) {
                let target = match &info {
                    RoutingInfo::Sharded { map, .. } => map.find_chunk_for_document(&doc).map(|c| c.shard.clone()),
                    RoutingInfo::Unsharded { primary } => Ok(primary.clone()),
                    RoutingInfo::Dropped => Err(ShardgateError::NamespaceNotFound(ns.to_string())),
                };
                match target {
                    Ok(shard) => groups.entry(shard).or_default().push((index, doc)),
                    Err(e) => reply.fail(&[(index, doc)], &e),
                }
            }
            router.ensure_shards_known(groups.keys()).await?;

            let requests = groups
                .iter()
                .map(|(shard, docs)| AsyncRequest {
                    shard: shard.clone(),
                    request: ShardRequest::versioned(
                        ns.clone(),
                        match &info {
                            RoutingInfo::Sharded { map, .. } => map.shard_version(shard),
                            _ => ChunkVersion::UNSHARDED,
                        },
                        ShardCommand::Insert {
                            documents: docs.iter().map(|(_, d)| d.clone()).collect(),
                        },
                    ),
                })
                .collect();
            let responses = AsyncRequestsSender::new(
                router.client(),
                ctx,
                requests,
                ReadPreference::PrimaryOnly,
                RetryPolicy::NotMasterOnly,
            )
            .collect_all()
            .await;

            for response in responses {
                let docs = groups.remove(&response.shard).unwrap_or_default();
                match response.result {
                    Ok(ShardResponse::Inserted { n }) => reply.n += n,
                    Ok(other) => reply.fail(
                        &docs,
                        &ShardgateError::Internal(format!("unexpected insert reply {other:?}")),
                    ),
                    Err(e) if e.is_stale_routing() && attempt < budget => {
                        debug!(%ns, shard = %response.shard, attempt, error = %e, "re-targeting stale insert batch");
                        note_stale(router, &e);
                        pending.extend(docs);
                    }
                    Err(e) => {
                        if e.is_stale_routing() {
                            note_stale(router, &e);
                        }
                        reply.fail(&docs, &e);
                    }
                }
            }
            pending.sort_by_key(|(index, _)| *index);
        }
        reply.write_errors.sort_by_key(|w| w.index);
        Ok(reply)
    }
}
