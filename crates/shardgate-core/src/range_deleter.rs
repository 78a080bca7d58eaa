//! Background deletion of ranges a shard no longer owns. Tasks live in the
//! catalog so they survive restarts; a failed attempt is counted and retried
//! on the next pass.

use crate::catalog::RangeDeletionTask;
use crate::error::{Result, ShardgateError};
use crate::op_context::OperationContext;
use crate::router::Router;
use crate::transport::{ShardCommand, ShardRequest, ShardResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeDeletionReport {
    pub completed: usize,
    pub failed: usize,
    pub deleted_docs: u64,
}

pub struct RangeDeleter {
    router: Router,
}

impl RangeDeleter {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Run one task to completion. Returns the number of documents deleted.
    /// The task is dropped when the collection is gone or the shard owns
    /// the range again; any other failure bumps its attempt count.
    pub async fn run_task(&self, ctx: &OperationContext, task: RangeDeletionTask) -> Result<u64> {
        let catalog = self.router.catalog();
        let current = catalog.get_collection(&task.ns).await?;
        if !current.is_some_and(|c| !c.dropped && c.uuid == task.collection_uuid) {
            debug!(ns = %task.ns, range = %task.range, "collection changed, dropping range deletion");
            catalog.remove_range_deletion(task.id).await?;
            return Ok(0);
        }

        let request = ShardRequest::new(
            task.ns.clone(),
            ShardCommand::DeleteRange {
                range: task.range.clone(),
            },
        );
        match self.router.send_to_primary(ctx, &task.shard, request).await {
            Ok(ShardResponse::Deleted { n }) => {
                catalog.remove_range_deletion(task.id).await?;
                Ok(n)
            }
            Ok(other) => Err(ShardgateError::Internal(format!(
                "unexpected reply to deleteRange: {other:?}"
            ))),
            Err(ShardgateError::IllegalOperation(reason)) => {
                info!(ns = %task.ns, range = %task.range, shard = %task.shard, %reason, "range owned again, dropping deletion");
                catalog.remove_range_deletion(task.id).await?;
                Ok(0)
            }
            Err(e) => {
                let attempts = task.attempts + 1;
                warn!(ns = %task.ns, range = %task.range, shard = %task.shard, attempts, error = %e, "range deletion failed");
                catalog
                    .put_range_deletion(RangeDeletionTask { attempts, ..task })
                    .await?;
                Err(e)
            }
        }
    }

    /// One pass over every pending task.
    pub async fn run_once(&self) -> Result<RangeDeletionReport> {
        let mut report = RangeDeletionReport::default();
        for task in self.router.catalog().list_range_deletions().await? {
            let ctx = OperationContext::with_timeout(self.router.params().default_op_timeout);
            match self.run_task(&ctx, task).await {
                Ok(n) => {
                    report.completed += 1;
                    report.deleted_docs += n;
                }
                Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.run_once().await {
                    Ok(report) if report.completed > 0 || report.failed > 0 => {
                        debug!(?report, "range deleter pass finished");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "range deleter pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MoveChunkOptions;
    use crate::catalog::CatalogClient;
    use crate::key::{KeyValue, ShardKey};
    use crate::testing::LocalCluster;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn orphans_are_deleted_after_a_failed_attempt() -> Result<()> {
        let cluster = LocalCluster::start(2).await?;
        let ns = cluster.shard_collection("db.c", "x", &[]).await?;
        let ctx = OperationContext::new();
        let docs: Vec<Value> = (0..10).map(|i| json!({"x": i})).collect();
        cluster.router().insert(&ctx, &ns, docs).await?;
        let from = cluster.owner_of(&ns, 0).await?;
        let to = cluster.other_shard(&from);
        cluster
            .coordinator
            .move_chunk(&ctx, &ns, &ShardKey::new(vec![KeyValue::Int(0)]), &to, MoveChunkOptions::default())
            .await?;
        assert_eq!(cluster.node(&from).documents(&ns).len(), 10);

        cluster.fail_command(&from, "deleteRange", ShardgateError::CommandFailed("disk full".into()));
        let deleter = cluster.coordinator.range_deleter();
        let report = deleter.run_once().await?;
        assert_eq!(report.failed, 1);
        let pending = cluster.catalog.list_range_deletions().await?;
        assert_eq!(pending[0].attempts, 1);

        let report = deleter.run_once().await?;
        assert_eq!(report.completed, 1);
        assert_eq!(report.deleted_docs, 10);
        assert!(cluster.node(&from).documents(&ns).is_empty());
        assert!(cluster.catalog.list_range_deletions().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn tasks_for_dropped_collections_are_discarded() -> Result<()> {
        let cluster = LocalCluster::start(2).await?;
        let ns = cluster.shard_collection("db.c", "x", &[]).await?;
        let entry = cluster.catalog.get_collection(&ns).await?.unwrap();
        let chunks = cluster.catalog.get_chunks(&ns, None).await?;
        let task = RangeDeletionTask {
            id: uuid::Uuid::new_v4(),
            ns: ns.clone(),
            collection_uuid: entry.uuid,
            range: chunks[0].range.clone(),
            shard: chunks[0].shard.clone(),
            attempts: 0,
        };
        cluster.catalog.put_range_deletion(task).await?;
        cluster.coordinator.drop_collection(&OperationContext::new(), &ns).await?;
        // Dropping already cleared the task list.
        assert!(cluster.catalog.list_range_deletions().await?.is_empty());

        let stale = RangeDeletionTask {
            id: uuid::Uuid::new_v4(),
            ns: ns.clone(),
            collection_uuid: entry.uuid,
            range: chunks[0].range.clone(),
            shard: chunks[0].shard.clone(),
            attempts: 3,
        };
        cluster.catalog.put_range_deletion(stale.clone()).await?;
        let n = cluster
            .coordinator
            .range_deleter()
            .run_task(&OperationContext::new(), stale)
            .await?;
        assert_eq!(n, 0);
        assert!(cluster.catalog.list_range_deletions().await?.is_empty());
        Ok(())
    }
}
