use crate::async_sender::{AsyncRequest, AsyncRequestsSender, RetryPolicy, ShardClient};
use crate::error::{Result, ShardgateError};
use crate::merger::{kill_remote_cursors, RemoteCursor};
use crate::namespace::ShardId;
use crate::op_context::OperationContext;
use crate::targeter::ReadPreference;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct EstablishedCursors {
    pub remotes: Vec<RemoteCursor>,
    /// Shards skipped because `allow_partial_results` was set.
    pub failed: Vec<(ShardId, ShardgateError)>,
}

impl EstablishedCursors {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Open one cursor per request. On a failure that cannot be tolerated every
/// cursor opened so far is killed before the error is returned, so nothing
/// leaks on the shards. Stale routing errors are never tolerated.
pub async fn establish_cursors(
    client: &ShardClient,
    ctx: &OperationContext,
    requests: Vec<AsyncRequest>,
    pref: ReadPreference,
    allow_partial_results: bool,
) -> Result<EstablishedCursors> {
    let mut sender = AsyncRequestsSender::new(client, ctx, requests, pref, RetryPolicy::Idempotent);
    let mut out = EstablishedCursors::default();
    let mut fatal: Option<ShardgateError> = None;

    while let Some(response) = sender.next().await {
        let opened = response
            .result
            .and_then(|r| r.into_cursor())
            .and_then(|batch| match response.host {
                Some(host) => Ok(RemoteCursor::from_batch(response.shard.clone(), host, batch)),
                None => Err(ShardgateError::Internal("cursor reply without a host".to_string())),
            });
        match opened {
            Ok(remote) => out.remotes.push(remote),
            Err(e) if fatal.is_some() => {
                debug!(shard = %response.shard, error = %e, "ignoring failure after abort");
            }
            Err(e) if allow_partial_results && e.is_retriable_network() => {
                warn!(shard = %response.shard, error = %e, "skipping unreachable shard");
                out.failed.push((response.shard, e));
            }
            Err(e) => {
                debug!(shard = %response.shard, error = %e, "cursor establishment failed");
                sender.cancel();
                fatal = Some(e);
            }
        }
    }

    match fatal {
        None => Ok(out),
        Some(e) => {
            let open: Vec<_> = out
                .remotes
                .into_iter()
                .filter(|r| r.cursor_id != 0)
                .map(|r| (r.host, r.namespace, r.cursor_id))
                .collect();
            if !open.is_empty() {
                let client = client.clone();
                tokio::spawn(async move { kill_remote_cursors(&client, open).await });
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogClient;
    use crate::namespace::Namespace;
    use crate::testing::LocalCluster;
    use crate::transport::{FindCommand, ShardCommand, ShardRequest};
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Two shards, `db.c` split at `{x: 0}` with three documents on each side.
    async fn seeded() -> Result<(LocalCluster, Namespace)> {
        let cluster = LocalCluster::start(2).await?;
        let ns = cluster.shard_collection("db.c", "x", &[0]).await?;
        let docs: Vec<Value> = (-3..3).map(|x| json!({"_id": x, "x": x})).collect();
        cluster.router().insert(&OperationContext::new(), &ns, docs).await?;
        Ok((cluster, ns))
    }

    async fn find_all(cluster: &LocalCluster, ns: &Namespace, batch_size: u32) -> Result<Vec<AsyncRequest>> {
        let chunks = cluster.catalog.get_chunks(ns, None).await?;
        Ok(cluster
            .nodes
            .keys()
            .filter_map(|shard| {
                let version = chunks
                    .iter()
                    .filter(|c| &c.shard == shard)
                    .map(|c| c.version)
                    .reduce(|a, b| if a.is_older_than(&b) { b } else { a })?;
                Some(AsyncRequest {
                    shard: shard.clone(),
                    request: ShardRequest::versioned(
                        ns.clone(),
                        version,
                        ShardCommand::Find(FindCommand {
                            filter: json!({}),
                            batch_size: Some(batch_size),
                            ..FindCommand::default()
                        }),
                    ),
                })
            })
            .collect())
    }

    #[tokio::test]
    async fn opens_one_cursor_per_shard() -> Result<()> {
        let (cluster, ns) = seeded().await?;
        let requests = find_all(&cluster, &ns, 2).await?;
        assert_eq!(requests.len(), 2);
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let est = establish_cursors(cluster.router().client(), &ctx, requests, ReadPreference::PrimaryOnly, false).await?;
        assert_eq!(est.remotes.len(), 2);
        assert!(!est.is_partial());
        assert!(est.remotes.iter().all(|r| r.batch.len() == 2 && r.cursor_id != 0));
        Ok(())
    }

    #[tokio::test]
    async fn fatal_failure_kills_opened_cursors() -> Result<()> {
        let (cluster, ns) = seeded().await?;
        let failing = cluster.owner_of(&ns, 0).await?;
        let healthy = cluster.other_shard(&failing);
        cluster.fail_command(&failing, "find", ShardgateError::CommandFailed("boom".into()));
        let requests = find_all(&cluster, &ns, 1).await?;
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let err = establish_cursors(cluster.router().client(), &ctx, requests, ReadPreference::PrimaryOnly, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardgateError::CommandFailed(_)));
        for _ in 0..50 {
            if cluster.node(&healthy).open_cursors() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cluster.node(&healthy).open_cursors(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_shards_are_skipped_when_partial() -> Result<()> {
        let (cluster, ns) = seeded().await?;
        let down = cluster.owner_of(&ns, 0).await?;
        cluster.transport.unregister(&LocalCluster::host_of(&down));
        let requests = find_all(&cluster, &ns, 2).await?;
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let est = establish_cursors(cluster.router().client(), &ctx, requests, ReadPreference::PrimaryOnly, true).await?;
        assert_eq!(est.remotes.len(), 1);
        assert!(est.is_partial());
        assert_eq!(est.failed[0].0, down);
        Ok(())
    }
}
