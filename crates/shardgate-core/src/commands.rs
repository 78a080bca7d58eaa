//! Database commands that are not queries. Each command is described by how
//! it reaches shards; `run_command` resolves the targets from routing info,
//! sends, and combines the replies.

use crate::async_sender::{AsyncRequest, AsyncRequestsSender, RetryPolicy};
use crate::cluster_find::note_stale;
use crate::error::{Result, ShardgateError};
use crate::namespace::{Namespace, ShardId};
use crate::op_context::OperationContext;
use crate::router::Router;
use crate::routing_cache::RoutingInfo;
use crate::targeter::ReadPreference;
use crate::transport::{ShardCommand, ShardRequest, ShardResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStrategy {
    /// Every shard in the cluster.
    AllShards,
    /// Unsharded collections only; forwarded to the database primary.
    NotAllowedOnSharded,
    /// The database primary, unversioned.
    PassthroughToPrimary,
    /// Shards selected from the collection's routing info, versioned.
    Targeted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub strategy: CommandStrategy,
}

pub const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: "listCollections",
        strategy: CommandStrategy::PassthroughToPrimary,
    },
    CommandDescriptor {
        name: "listIndexes",
        strategy: CommandStrategy::Targeted,
    },
    CommandDescriptor {
        name: "count",
        strategy: CommandStrategy::Targeted,
    },
    CommandDescriptor {
        name: "createIndexes",
        strategy: CommandStrategy::Targeted,
    },
    CommandDescriptor {
        name: "collStats",
        strategy: CommandStrategy::AllShards,
    },
    CommandDescriptor {
        name: "renameCollection",
        strategy: CommandStrategy::NotAllowedOnSharded,
    },
];

pub fn descriptor(name: &str) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|c| c.name == name)
}

fn empty_filter() -> Value {
    json!({})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum CommandRequest {
    ListCollections,
    ListIndexes {
        coll: String,
    },
    Count {
        coll: String,
        #[serde(default = "empty_filter")]
        filter: Value,
    },
    CreateIndexes {
        coll: String,
        indexes: Vec<Value>,
    },
    CollStats {
        coll: String,
    },
    RenameCollection {
        coll: String,
        to: String,
    },
}

impl CommandRequest {
    pub fn name(&self) -> &'static str {
        match self {
            CommandRequest::ListCollections => "listCollections",
            CommandRequest::ListIndexes { .. } => "listIndexes",
            CommandRequest::Count { .. } => "count",
            CommandRequest::CreateIndexes { .. } => "createIndexes",
            CommandRequest::CollStats { .. } => "collStats",
            CommandRequest::RenameCollection { .. } => "renameCollection",
        }
    }
}

/// Which shards of a collection a targeted command visits.
enum Selection {
    Query(Value),
    /// Owner of the lowest chunk, or the primary.
    First,
    /// Every shard owning a chunk, or the primary.
    Owners,
}

pub async fn run_command(router: &Router, ctx: &OperationContext, db: &str, request: CommandRequest) -> Result<Value> {
    let descriptor = descriptor(request.name())
        .ok_or_else(|| ShardgateError::CommandFailed(format!("unknown command {}", request.name())))?;
    let strategy = descriptor.strategy;
    match request {
        CommandRequest::ListCollections => {
            let ns = Namespace::new(db, "$cmd");
            let replies = dispatch(router, ctx, &ns, strategy, None, ShardCommand::ListCollections).await?;
            let mut names: BTreeSet<String> = items(replies)
                .filter_map(|item| item.get("name").and_then(Value::as_str).map(str::to_string))
                .collect();
            let sharded: BTreeSet<String> = router
                .catalog()
                .list_collections(Some(db))
                .await?
                .into_iter()
                .filter(|c| !c.dropped)
                .map(|c| c.ns.coll)
                .collect();
            names.extend(sharded.iter().cloned());
            let collections: Vec<Value> = names
                .into_iter()
                .map(|name| json!({"name": name, "sharded": sharded.contains(&name)}))
                .collect();
            Ok(json!({ "collections": collections }))
        }
        CommandRequest::ListIndexes { coll } => {
            let ns = Namespace::new(db, coll);
            let replies = dispatch(router, ctx, &ns, strategy, Some(Selection::First), ShardCommand::ListIndexes).await?;
            Ok(json!({ "indexes": items(replies).collect::<Vec<_>>() }))
        }
        CommandRequest::Count { coll, filter } => {
            let ns = Namespace::new(db, coll);
            let command = ShardCommand::Count { filter: filter.clone() };
            let replies = dispatch(router, ctx, &ns, strategy, Some(Selection::Query(filter)), command).await?;
            let n: u64 = counts(&replies)?.values().sum();
            Ok(json!({ "n": n }))
        }
        CommandRequest::CreateIndexes { coll, indexes } => {
            let ns = Namespace::new(db, coll);
            let command = ShardCommand::CreateIndexes { indexes };
            let replies = dispatch(router, ctx, &ns, strategy, Some(Selection::Owners), command).await?;
            let shards: Vec<&str> = replies.keys().map(ShardId::as_str).collect();
            Ok(json!({ "ok": 1, "shards": shards }))
        }
        CommandRequest::CollStats { coll } => {
            let ns = Namespace::new(db, coll);
            let sharded = router.routing().get_routing_info(&ns).await?.is_sharded();
            let command = ShardCommand::Count { filter: empty_filter() };
            let replies = dispatch(router, ctx, &ns, strategy, None, command).await?;
            let per_shard = counts(&replies)?;
            let total: u64 = per_shard.values().sum();
            let shards: Map<String, Value> = per_shard
                .into_iter()
                .filter(|(_, n)| *n > 0)
                .map(|(s, n)| (s.to_string(), json!(n)))
                .collect();
            Ok(json!({ "ns": ns.to_string(), "sharded": sharded, "count": total, "shards": shards }))
        }
        CommandRequest::RenameCollection { coll, to } => {
            let ns = Namespace::new(db, coll);
            let command = ShardCommand::RenameCollection {
                to: Namespace::new(db, to),
            };
            dispatch(router, ctx, &ns, strategy, None, command).await?;
            router.routing().purge(&ns);
            Ok(json!({ "ok": 1 }))
        }
    }
}

fn items(replies: BTreeMap<ShardId, ShardResponse>) -> impl Iterator<Item = Value> {
    replies.into_values().flat_map(|r| match r {
        ShardResponse::Items(items) => items,
        _ => Vec::new(),
    })
}

fn counts(replies: &BTreeMap<ShardId, ShardResponse>) -> Result<BTreeMap<ShardId, u64>> {
    replies
        .iter()
        .map(|(shard, r)| match r {
            ShardResponse::Count { n } => Ok((shard.clone(), *n)),
            other => Err(ShardgateError::Internal(format!("expected a count from {shard}, got {other:?}"))),
        })
        .collect()
}

/// Send `command` to the shards `strategy` selects, restarting with fresh
/// routing when a shard reports stale metadata.
async fn dispatch(
    router: &Router,
    ctx: &OperationContext,
    ns: &Namespace,
    strategy: CommandStrategy,
    selection: Option<Selection>,
    command: ShardCommand,
) -> Result<BTreeMap<ShardId, ShardResponse>> {
    let budget = router.params().read_stale_retries.max(1);
    let policy = if command.is_idempotent() {
        RetryPolicy::Idempotent
    } else {
        RetryPolicy::NotMasterOnly
    };
    let mut attempt = 0;
    loop {
        attempt += 1;
        ctx.check_for_interrupt()?;
        let requests = select_targets(router, ns, strategy, selection.as_ref(), &command).await?;
        router.ensure_shards_known(requests.iter().map(|r| &r.shard)).await?;
        let responses = AsyncRequestsSender::new(router.client(), ctx, requests, ReadPreference::PrimaryOnly, policy)
            .collect_all()
            .await;

        let mut out = BTreeMap::new();
        let mut stale = None;
        for response in responses {
            match response.result {
                Ok(reply) => {
                    out.insert(response.shard, reply);
                }
                Err(e) if e.is_stale_routing() => {
                    note_stale(router, &e);
                    stale = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match stale {
            None => return Ok(out),
            Some(e) if attempt >= budget => return Err(e),
            Some(e) => debug!(%ns, command = command.name(), attempt, error = %e, "retrying command after stale routing"),
        }
    }
}

async fn db_primary(router: &Router, ns: &Namespace) -> Result<ShardId> {
    Ok(router.routing().get_database(&ns.db).await?.primary)
}

async fn select_targets(
    router: &Router,
    ns: &Namespace,
    strategy: CommandStrategy,
    selection: Option<&Selection>,
    command: &ShardCommand,
) -> Result<Vec<AsyncRequest>> {
    let unversioned = |shards: Vec<ShardId>| {
        shards
            .into_iter()
            .map(|shard| AsyncRequest {
                shard,
                request: ShardRequest::new(ns.clone(), command.clone()),
            })
            .collect()
    };
    match strategy {
        CommandStrategy::AllShards => Ok(unversioned(router.registry().all_shard_ids())),
        CommandStrategy::PassthroughToPrimary => Ok(unversioned(vec![db_primary(router, ns).await?])),
        CommandStrategy::NotAllowedOnSharded => match router.routing().get_routing_info(ns).await? {
            RoutingInfo::Sharded { .. } => Err(ShardgateError::IllegalOperation(format!(
                "{} is not allowed on sharded collection {ns}",
                command.name()
            ))),
            _ => Ok(unversioned(vec![db_primary(router, ns).await?])),
        },
        CommandStrategy::Targeted => {
            let info = match router.routing().get_routing_info(ns).await? {
                RoutingInfo::Dropped => RoutingInfo::Unsharded {
                    primary: db_primary(router, ns).await?,
                },
                info => info,
            };
            let shards: Vec<ShardId> = match (&info, selection) {
                (RoutingInfo::Sharded { map, .. }, Some(Selection::Query(filter))) => {
                    map.shards_for_query(filter, None).into_iter().collect()
                }
                (RoutingInfo::Sharded { map, .. }, Some(Selection::First)) => map
                    .chunks()
                    .next()
                    .map(|c| vec![c.shard.clone()])
                    .unwrap_or_default(),
                (RoutingInfo::Sharded { map, .. }, _) => map.all_shard_ids().into_iter().collect(),
                (info, _) => info.primary().cloned().into_iter().collect(),
            };
            Ok(shards
                .into_iter()
                .map(|shard| AsyncRequest {
                    request: ShardRequest::versioned(ns.clone(), info.version_for(&shard), command.clone()),
                    shard,
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_request_has_a_descriptor() {
        let requests = [
            CommandRequest::ListCollections,
            CommandRequest::ListIndexes { coll: "c".into() },
            CommandRequest::Count {
                coll: "c".into(),
                filter: json!({}),
            },
            CommandRequest::CreateIndexes {
                coll: "c".into(),
                indexes: vec![],
            },
            CommandRequest::CollStats { coll: "c".into() },
            CommandRequest::RenameCollection {
                coll: "c".into(),
                to: "d".into(),
            },
        ];
        for r in &requests {
            assert!(descriptor(r.name()).is_some(), "{}", r.name());
        }
        assert_eq!(descriptor("count").map(|d| d.strategy), Some(CommandStrategy::Targeted));
        assert!(descriptor("aggregate").is_none());
    }

    #[test]
    fn requests_parse_from_json() {
        let r: CommandRequest = serde_json::from_value(json!({"command": "count", "coll": "c"})).unwrap();
        assert_eq!(
            r,
            CommandRequest::Count {
                coll: "c".into(),
                filter: json!({})
            }
        );
    }
}
