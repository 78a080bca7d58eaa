//! A whole cluster in one process: catalog, reference shard nodes, a local
//! transport, a router and a coordinator. Only built for tests and with the
//! `testing` feature.

use crate::catalog::CatalogClient;
use crate::catalog_store::InMemoryCatalog;
use crate::clock::ClusterClock;
use crate::commands::CommandRequest;
use crate::config::ClusterParams;
use crate::coordinator::Coordinator;
use crate::error::{Result, ShardgateError};
use crate::key::{KeyValue, ShardKey, ShardKeyPattern};
use crate::namespace::{Namespace, ShardId};
use crate::op_context::OperationContext;
use crate::registry::{ConnectionString, HostAndPort};
use crate::router::Router;
use crate::shard_node::InMemoryShard;
use crate::transport::{Fault, LocalTransport, ShardTransport};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct LocalCluster {
    pub catalog: Arc<InMemoryCatalog>,
    pub clock: Arc<ClusterClock>,
    pub transport: Arc<LocalTransport>,
    pub params: ClusterParams,
    pub coordinator: Arc<Coordinator>,
    pub nodes: BTreeMap<ShardId, Arc<InMemoryShard>>,
}

impl LocalCluster {
    /// `n` shards named `shard0`, `shard1`, ... with test timings.
    pub async fn start(n: usize) -> Result<Self> {
        Self::start_with(n, ClusterParams::for_tests()).await
    }

    pub async fn start_with(n: usize, params: ClusterParams) -> Result<Self> {
        Self::start_on(Arc::new(InMemoryCatalog::new()), n, params).await
    }

    /// Cluster over an existing catalog, e.g. one reopened from disk. Shards
    /// already listed in the catalog get fresh, empty nodes.
    pub async fn start_on(catalog: Arc<InMemoryCatalog>, n: usize, params: ClusterParams) -> Result<Self> {
        let clock = Arc::new(ClusterClock::new());
        let transport = Arc::new(LocalTransport::new());
        let catalog_client: Arc<dyn CatalogClient> = catalog.clone();
        let shard_transport: Arc<dyn ShardTransport> = transport.clone();
        let router = Router::new(catalog_client, shard_transport, params.clone());
        let coordinator = Arc::new(Coordinator::new(router, clock.clone(), "local-coordinator"));
        let mut cluster = Self {
            catalog,
            clock,
            transport,
            params,
            coordinator,
            nodes: BTreeMap::new(),
        };
        for entry in cluster.catalog.list_shards().await? {
            cluster.spawn_node(entry.id.clone(), &entry.connection_string);
        }
        while cluster.nodes.len() < n {
            cluster.add_node().await?;
        }
        cluster.router().reload_shards().await?;
        Ok(cluster)
    }

    pub fn router(&self) -> &Router {
        self.coordinator.router()
    }

    /// Another router over the same catalog and shards, with its own caches.
    pub fn new_router(&self) -> Router {
        let catalog: Arc<dyn CatalogClient> = self.catalog.clone();
        let transport: Arc<dyn ShardTransport> = self.transport.clone();
        Router::new(catalog, transport, self.params.clone())
    }

    pub fn host_of(id: &ShardId) -> HostAndPort {
        HostAndPort::new(id.as_str(), 27018)
    }

    fn spawn_node(&mut self, id: ShardId, conn: &ConnectionString) -> Arc<InMemoryShard> {
        let catalog: Arc<dyn CatalogClient> = self.catalog.clone();
        let node = Arc::new(InMemoryShard::new(id.clone(), catalog, self.clock.clone(), self.params.clone()));
        for host in conn.hosts() {
            self.transport.register(host.clone(), node.clone());
        }
        self.nodes.insert(id, node.clone());
        node
    }

    /// Start one more shard and register it through the coordinator.
    pub async fn add_node(&mut self) -> Result<ShardId> {
        let id = ShardId::new(format!("shard{}", self.nodes.len()));
        let conn = ConnectionString::standalone(Self::host_of(&id));
        self.spawn_node(id.clone(), &conn);
        let ctx = OperationContext::new();
        self.coordinator.add_shard(&ctx, id.clone(), conn, 0).await?;
        Ok(id)
    }

    pub fn node(&self, id: &ShardId) -> Arc<InMemoryShard> {
        match self.nodes.get(id) {
            Some(node) => node.clone(),
            None => panic!("no local node {id}"),
        }
    }

    /// Any shard other than `id`.
    pub fn other_shard(&self, id: &ShardId) -> ShardId {
        match self.nodes.keys().find(|s| *s != id) {
            Some(other) => other.clone(),
            None => panic!("cluster has no shard besides {id}"),
        }
    }

    /// Enable sharding on the database of `ns` and shard it on `field`,
    /// pre-split at the given integer points.
    pub async fn shard_collection(&self, ns: &str, field: &str, split_points: &[i64]) -> Result<Namespace> {
        let ns = Namespace::parse(ns)?;
        self.coordinator.enable_sharding(&ns.db, None).await?;
        let points = split_points
            .iter()
            .map(|p| ShardKey::new(vec![KeyValue::Int(*p)]))
            .collect();
        self.coordinator
            .shard_collection(
                &OperationContext::new(),
                &ns,
                ShardKeyPattern::new(vec![field])?,
                false,
                points,
                None,
            )
            .await?;
        Ok(ns)
    }

    /// Owner of integer key `key` according to the catalog.
    pub async fn owner_of(&self, ns: &Namespace, key: i64) -> Result<ShardId> {
        let key = ShardKey::new(vec![KeyValue::Int(key)]);
        self.catalog
            .get_chunks(ns, None)
            .await?
            .into_iter()
            .find(|c| c.contains(&key))
            .map(|c| c.shard)
            .ok_or_else(|| ShardgateError::KeyOutOfRange(format!("{key} in {ns}")))
    }

    pub async fn owned_chunks(&self, ns: &Namespace, shard: &ShardId) -> Result<usize> {
        Ok(self
            .catalog
            .get_chunks(ns, None)
            .await?
            .iter()
            .filter(|c| &c.shard == shard)
            .count())
    }

    /// Documents of `ns` as the router counts them.
    pub async fn count(&self, ns: &Namespace) -> Result<u64> {
        let reply = self
            .router()
            .run_command(
                &OperationContext::new(),
                &ns.db,
                CommandRequest::Count {
                    coll: ns.coll.clone(),
                    filter: serde_json::json!({}),
                },
            )
            .await?;
        reply["n"]
            .as_u64()
            .ok_or_else(|| ShardgateError::Internal(format!("malformed count reply {reply}")))
    }

    /// Fail the next `command` sent to `shard` with `error`.
    pub fn fail_command(&self, shard: &ShardId, command: &'static str, error: ShardgateError) {
        self.transport.inject_fault(Fault {
            host: Some(Self::host_of(shard)),
            command: Some(command),
            error,
            times: 1,
        });
    }
}
