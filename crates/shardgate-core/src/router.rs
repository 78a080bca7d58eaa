use crate::async_sender::{RetryPolicy, ShardClient};
use crate::catalog::CatalogClient;
use crate::cluster_find::{ClusterFind, FindReply, FindRequest, GetMoreRequest, KillCursorsReply};
use crate::cluster_write::{ClusterWriter, InsertReply};
use crate::commands::{self, CommandRequest};
use crate::config::ClusterParams;
use crate::cursor_manager::ClusterCursorManager;
use crate::error::{Result, ShardgateError};
use crate::namespace::{Namespace, ShardId};
use crate::op_context::OperationContext;
use crate::pool::ConnectionPools;
use crate::registry::{ConnectionString, HostAndPort, ShardRegistry};
use crate::routing_cache::{RoutingCache, RoutingInfo};
use crate::targeter::ReadPreference;
use crate::transport::{ShardRequest, ShardResponse, ShardTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a routing process needs, passed around explicitly. Cheap to
/// clone; clones share caches and connections.
#[derive(Clone)]
pub struct Router {
    catalog: Arc<dyn CatalogClient>,
    registry: Arc<ShardRegistry>,
    routing: RoutingCache,
    transport: Arc<dyn ShardTransport>,
    client: ShardClient,
    cursors: Arc<ClusterCursorManager>,
    params: Arc<ClusterParams>,
}

impl Router {
    pub fn new(catalog: Arc<dyn CatalogClient>, transport: Arc<dyn ShardTransport>, params: ClusterParams) -> Self {
        let params = Arc::new(params);
        let registry = Arc::new(ShardRegistry::new(
            ConnectionString::standalone(HostAndPort::new("config", 0)),
            params.host_cooldown,
        ));
        let pools = Arc::new(ConnectionPools::new(params.max_connections_per_host));
        let client = ShardClient::new(registry.clone(), transport.clone(), pools, params.clone());
        Self {
            routing: RoutingCache::new(catalog.clone()),
            catalog,
            registry,
            transport,
            client,
            cursors: Arc::new(ClusterCursorManager::new()),
            params,
        }
    }

    /// A router with its shard registry loaded from the catalog.
    pub async fn start(
        catalog: Arc<dyn CatalogClient>,
        transport: Arc<dyn ShardTransport>,
        params: ClusterParams,
    ) -> Result<Self> {
        let router = Self::new(catalog, transport, params);
        router.reload_shards().await?;
        Ok(router)
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogClient> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &RoutingCache {
        &self.routing
    }

    pub fn transport(&self) -> &Arc<dyn ShardTransport> {
        &self.transport
    }

    pub fn client(&self) -> &ShardClient {
        &self.client
    }

    pub fn cursors(&self) -> &Arc<ClusterCursorManager> {
        &self.cursors
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    pub async fn reload_shards(&self) -> Result<()> {
        self.registry.reload(self.catalog.as_ref()).await
    }

    /// Reload the registry once if any of `shards` is unknown to it, e.g. a
    /// shard added through another router.
    pub(crate) async fn ensure_shards_known<'a>(&self, shards: impl IntoIterator<Item = &'a ShardId>) -> Result<()> {
        let missing = shards
            .into_iter()
            .any(|s| matches!(self.registry.get_shard(s), Err(ShardgateError::ShardNotFound(_))));
        if missing {
            debug!("unknown shard targeted, reloading registry");
            self.reload_shards().await?;
        }
        Ok(())
    }

    /// One command to the primary of `shard`. Network failures are retried
    /// only when the command is safe to repeat.
    pub(crate) async fn send_to_primary(
        &self,
        ctx: &OperationContext,
        shard: &ShardId,
        request: ShardRequest,
    ) -> Result<ShardResponse> {
        self.ensure_shards_known(std::iter::once(shard)).await?;
        let policy = if request.command.is_idempotent() {
            RetryPolicy::Idempotent
        } else {
            RetryPolicy::NotMasterOnly
        };
        let (_, response) = self
            .client
            .send_to_shard(ctx, shard, request, ReadPreference::PrimaryOnly, policy)
            .await?;
        Ok(response)
    }

    pub async fn find(&self, ctx: &OperationContext, request: FindRequest) -> Result<FindReply> {
        ClusterFind::find(self, ctx, request).await
    }

    pub async fn get_more(&self, ctx: &OperationContext, request: GetMoreRequest) -> Result<FindReply> {
        ClusterFind::get_more(self, ctx, request).await
    }

    pub fn kill_cursors(&self, ns: &Namespace, cursor_ids: &[u64]) -> KillCursorsReply {
        ClusterFind::kill_cursors(self, ns, cursor_ids)
    }

    pub async fn insert(&self, ctx: &OperationContext, ns: &Namespace, documents: Vec<Value>) -> Result<InsertReply> {
        ClusterWriter::insert(self, ctx, ns, documents).await
    }

    pub async fn run_command(&self, ctx: &OperationContext, db: &str, command: CommandRequest) -> Result<Value> {
        commands::run_command(self, ctx, db, command).await
    }

    /// Routing table of `ns` as the cache currently sees it.
    pub async fn describe_routing(&self, ns: &Namespace) -> Result<Value> {
        Ok(match self.routing.get_routing_info(ns).await? {
            RoutingInfo::Sharded { map, primary } => {
                let pattern = map.key_pattern();
                let chunks: Vec<Value> = map
                    .chunks()
                    .map(|c| {
                        json!({
                            "min": pattern.to_json_key(c.min()),
                            "max": pattern.to_json_key(c.max()),
                            "shard": c.shard.as_str(),
                            "version": c.version.to_string(),
                            "jumbo": c.jumbo,
                        })
                    })
                    .collect();
                json!({
                    "ns": ns.to_string(),
                    "sharded": true,
                    "primary": primary.as_str(),
                    "key": pattern.to_json(),
                    "epoch": map.epoch().as_uuid().to_string(),
                    "version": map.collection_version().to_string(),
                    "chunks": chunks,
                })
            }
            RoutingInfo::Unsharded { primary } => json!({
                "ns": ns.to_string(),
                "sharded": false,
                "primary": primary.as_str(),
            }),
            RoutingInfo::Dropped => return Err(ShardgateError::NamespaceNotFound(ns.to_string())),
        })
    }

    /// Periodically kill cursors nobody has used for `idle_timeout`.
    pub fn spawn_cursor_reaper(&self, idle_timeout: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cursors = self.cursors.clone();
        tokio::spawn(async move {
            let every = (idle_timeout / 4).max(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                let n = cursors.kill_idle(idle_timeout);
                if n > 0 {
                    debug!(n, "reaped idle cursors");
                }
            }
        })
    }
}
