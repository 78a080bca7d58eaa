//! Chunk balancer. Each round moves at most one chunk per collection:
//! off a draining shard first, otherwise from the shard with the most chunks
//! to the one with the fewest when they differ by the threshold.

use crate::coordinator::{Coordinator, MigrationOutcome, MoveChunkOptions};
use crate::error::Result;
use crate::namespace::ShardId;
use crate::op_context::OperationContext;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Balancer {
    coordinator: Arc<Coordinator>,
}

impl Balancer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn balance_round(&self) -> Result<Vec<MigrationOutcome>> {
        let router = self.coordinator.router();
        let catalog = router.catalog();
        let params = router.params();
        let shards = catalog.list_shards().await?;
        let active: BTreeSet<ShardId> = shards.iter().filter(|s| !s.draining).map(|s| s.id.clone()).collect();
        let draining: BTreeSet<ShardId> = shards.iter().filter(|s| s.draining).map(|s| s.id.clone()).collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let mut moves = Vec::new();
        for coll in catalog.list_collections(None).await? {
            if coll.dropped {
                continue;
            }
            let ns = coll.ns;
            let chunks = catalog.get_chunks(&ns, None).await?;
            let mut load: BTreeMap<ShardId, usize> = active.iter().map(|s| (s.clone(), 0)).collect();
            for chunk in &chunks {
                if let Some(n) = load.get_mut(&chunk.shard) {
                    *n += 1;
                }
            }
            let Some((lightest, min)) = load.iter().min_by_key(|(_, n)| **n).map(|(s, n)| (s.clone(), *n)) else {
                continue;
            };

            let candidate = match chunks.iter().find(|c| draining.contains(&c.shard) && !c.jumbo) {
                Some(chunk) => Some(chunk),
                None => load
                    .iter()
                    .max_by_key(|(_, n)| **n)
                    .filter(|(_, max)| **max >= min + params.balancer_threshold)
                    .and_then(|(heaviest, _)| chunks.iter().find(|c| &c.shard == heaviest && !c.jumbo)),
            };
            let Some(chunk) = candidate else {
                continue;
            };

            let ctx = OperationContext::with_timeout(params.default_op_timeout);
            debug!(%ns, range = %chunk.range, from = %chunk.shard, to = %lightest, "balancer moving chunk");
            match self
                .coordinator
                .move_chunk(&ctx, &ns, chunk.min(), &lightest, MoveChunkOptions::default())
                .await
            {
                Ok(outcome) => moves.push(outcome),
                Err(e) => warn!(%ns, range = %chunk.range, error = %e, "balancer move failed"),
            }
        }
        if !moves.is_empty() {
            info!(moves = moves.len(), "balancer round finished");
        }
        Ok(moves)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = self.balance_round().await {
                    warn!(error = %e, "balancer round failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RemoveShardStatus;
    use crate::catalog::CatalogClient;
    use crate::testing::LocalCluster;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn rounds_even_out_chunk_counts() -> Result<()> {
        let mut cluster = LocalCluster::start(1).await?;
        let ns = cluster.shard_collection("db.c", "x", &[10, 20, 30, 40, 50]).await?;
        let ctx = OperationContext::new();
        let docs: Vec<Value> = (0..60).map(|i| json!({"x": i})).collect();
        cluster.router().insert(&ctx, &ns, docs).await?;
        cluster.add_node().await?;

        let balancer = Balancer::new(cluster.coordinator.clone());
        let mut rounds = 0;
        while !balancer.balance_round().await?.is_empty() {
            rounds += 1;
            assert!(rounds < 10, "balancer did not converge");
        }
        assert_eq!(rounds, 3);
        for node in cluster.nodes.values() {
            let owned = cluster.owned_chunks(&ns, node.id()).await?;
            assert_eq!(owned, 3);
        }
        cluster.coordinator.range_deleter().run_once().await?;
        assert_eq!(cluster.count(&ns).await?, 60);
        Ok(())
    }

    #[tokio::test]
    async fn draining_shards_are_emptied() -> Result<()> {
        let cluster = LocalCluster::start(3).await?;
        let ns = cluster.shard_collection("db.c", "x", &[0, 10]).await?;
        let primary = cluster.catalog.get_database("db").await?.primary;
        let leaving = cluster.other_shard(&primary);
        assert!(matches!(
            cluster.coordinator.remove_shard(&leaving).await?,
            RemoveShardStatus::Started { chunks: 1, .. }
        ));

        let balancer = Balancer::new(cluster.coordinator.clone());
        let moves = balancer.balance_round().await?;
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from, leaving);
        assert_eq!(cluster.owned_chunks(&ns, &leaving).await?, 0);
        assert_eq!(cluster.coordinator.remove_shard(&leaving).await?, RemoveShardStatus::Completed);
        Ok(())
    }
}
