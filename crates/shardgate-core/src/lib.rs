pub mod async_sender;
pub mod balancer;
pub mod catalog;
pub mod catalog_store;
pub mod chunk;
pub mod chunk_map;
pub mod clock;
pub mod cluster_find;
pub mod cluster_write;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod cursor_manager;
pub mod dist_lock;
pub mod error;
pub mod establish;
pub mod journal;
pub mod key;
pub mod merger;
pub mod namespace;
pub mod op_context;
pub mod pool;
pub mod query;
pub mod range_deleter;
pub mod registry;
pub mod router;
pub mod routing_cache;
pub mod shard_node;
pub mod targeter;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod version;

pub use balancer::Balancer;
pub use catalog::{CatalogChannel, CatalogClient, CatalogReply, CatalogRequest, RemoteCatalog};
pub use catalog_store::InMemoryCatalog;
pub use chunk::Chunk;
pub use chunk_map::ChunkMap;
pub use clock::{ClusterClock, Timestamp};
pub use cluster_find::{FindReply, FindRequest, GetMoreRequest, KillCursorsReply};
pub use cluster_write::InsertReply;
pub use commands::CommandRequest;
pub use config::ClusterParams;
pub use coordinator::{Coordinator, MigrationOutcome, MoveChunkOptions, RemoveShardStatus};
pub use error::{ErrorCode, Result, ShardgateError};
pub use key::{KeyRange, KeyValue, ShardKey, ShardKeyPattern};
pub use namespace::{Namespace, ShardId};
pub use op_context::OperationContext;
pub use range_deleter::RangeDeleter;
pub use registry::{ConnectionString, HostAndPort};
pub use router::Router;
pub use shard_node::InMemoryShard;
#[cfg(any(test, feature = "testing"))]
pub use testing::LocalCluster;
pub use transport::{ShardRequest, ShardResponse, ShardTransport};
pub use version::{ChunkVersion, Epoch};
