use crate::error::{Result, ShardgateError};
use crate::registry::HostAndPort;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds outstanding requests per host. A permit is held for the lifetime of
/// one request; requests beyond the limit queue in FIFO order.
pub struct ConnectionPools {
    limit: usize,
    pools: Mutex<HashMap<HostAndPort, Arc<Semaphore>>>,
}

impl ConnectionPools {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self, host: &HostAndPort) -> Arc<Semaphore> {
        self.pools
            .lock()
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
            .clone()
    }

    pub async fn acquire(&self, host: &HostAndPort) -> Result<OwnedSemaphorePermit> {
        self.pool(host)
            .acquire_owned()
            .await
            .map_err(|_| ShardgateError::HostUnreachable(format!("connection pool for {host} closed")))
    }

    pub fn in_use(&self, host: &HostAndPort) -> usize {
        let pools = self.pools.lock();
        pools
            .get(host)
            .map(|s| self.limit - s.available_permits())
            .unwrap_or(0)
    }

    /// Fail every queued and future acquire for `host`, e.g. after removal.
    pub fn drop_host(&self, host: &HostAndPort) {
        if let Some(pool) = self.pools.lock().remove(host) {
            pool.close();
        }
    }
}
