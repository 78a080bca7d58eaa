use crate::catalog::{CatalogClient, LockDocument};
use crate::clock::now_millis;
use crate::error::{Result, ShardgateError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lease-based locks stored in the catalog. A held lock is kept alive by a
/// heartbeat task; a lock whose holder stopped renewing can be overtaken
/// once its lease runs out.
pub struct DistLockManager {
    catalog: Arc<dyn CatalogClient>,
    process_id: String,
    lease: Duration,
    retry_interval: Duration,
    default_wait: Duration,
}

impl DistLockManager {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        process_id: impl Into<String>,
        lease: Duration,
        retry_interval: Duration,
        default_wait: Duration,
    ) -> Self {
        Self {
            catalog,
            process_id: process_id.into(),
            lease,
            retry_interval,
            default_wait,
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Acquire `name`, waiting at most `wait` (or the configured default)
    /// before failing with `ConflictingOperationInProgress`.
    pub async fn lock(&self, name: &str, why: &str, wait: Option<Duration>) -> Result<DistLockGuard> {
        let deadline = Instant::now() + wait.unwrap_or(self.default_wait);
        let doc = LockDocument {
            name: name.to_string(),
            holder: self.process_id.clone(),
            lock_id: Uuid::new_v4(),
            lease_at_ms: 0,
            lease_ms: self.lease.as_millis() as u64,
            why: why.to_string(),
        };
        loop {
            match self.catalog.try_lock(doc.clone(), now_millis()).await? {
                Ok(()) => {
                    debug!(lock = name, why, "distributed lock acquired");
                    return Ok(DistLockGuard::start(self.catalog.clone(), doc, self.lease));
                }
                Err(holder) => {
                    if Instant::now() + self.retry_interval >= deadline {
                        return Err(ShardgateError::ConflictingOperationInProgress(format!(
                            "lock {name} is held by {} for '{}'",
                            holder.holder, holder.why
                        )));
                    }
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// Held distributed lock. Release explicitly; dropping releases in the
/// background.
pub struct DistLockGuard {
    catalog: Arc<dyn CatalogClient>,
    name: String,
    lock_id: Uuid,
    stop: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl DistLockGuard {
    fn start(catalog: Arc<dyn CatalogClient>, doc: LockDocument, lease: Duration) -> Self {
        let stop = CancellationToken::new();
        let heartbeat = {
            let catalog = catalog.clone();
            let stop = stop.clone();
            let name = doc.name.clone();
            let lock_id = doc.lock_id;
            let every = (lease / 3).max(Duration::from_millis(1));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(every) => {}
                    }
                    match catalog.renew_lock(&name, lock_id, now_millis()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(lock = %name, "distributed lock lost");
                            return;
                        }
                        Err(e) => warn!(lock = %name, error = %e, "lease renewal failed"),
                    }
                }
            })
        };
        Self {
            catalog,
            name: doc.name,
            lock_id: doc.lock_id,
            stop,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    pub async fn release(mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.await;
        }
        self.catalog.unlock(&self.name, self.lock_id).await
    }
}

impl Drop for DistLockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.heartbeat.take() else {
            return;
        };
        self.stop.cancel();
        handle.abort();
        let catalog = self.catalog.clone();
        let name = std::mem::take(&mut self.name);
        let lock_id = self.lock_id;
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = catalog.unlock(&name, lock_id).await {
                    warn!(lock = %name, error = %e, "background unlock failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::InMemoryCatalog;

    fn manager(catalog: &Arc<InMemoryCatalog>, who: &str, lease_ms: u64) -> DistLockManager {
        DistLockManager::new(
            catalog.clone(),
            who,
            Duration::from_millis(lease_ms),
            Duration::from_millis(5),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn contention_fails_after_bounded_wait() -> Result<()> {
        let catalog = Arc::new(InMemoryCatalog::new());
        let p1 = manager(&catalog, "p1", 1_000);
        let p2 = manager(&catalog, "p2", 1_000);

        let held = p1.lock("db.c", "moveChunk", None).await?;
        let err = p2.lock("db.c", "split", None).await.err();
        assert!(matches!(err, Some(ShardgateError::ConflictingOperationInProgress(_))));

        held.release().await?;
        let again = p2.lock("db.c", "split", None).await?;
        assert_eq!(
            catalog.get_lock("db.c").await?.map(|l| l.holder),
            Some("p2".to_string())
        );
        again.release().await?;
        assert!(catalog.get_lock("db.c").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_keeps_short_leases_alive() -> Result<()> {
        let catalog = Arc::new(InMemoryCatalog::new());
        let p1 = manager(&catalog, "p1", 60);
        let p2 = manager(&catalog, "p2", 60);
        let held = p1.lock("db.c", "drop", None).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(p2.lock("db.c", "drop", Some(Duration::from_millis(20))).await.is_err());
        held.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_leases_are_overtaken() -> Result<()> {
        let catalog = Arc::new(InMemoryCatalog::new());
        let stale = LockDocument {
            name: "db.c".into(),
            holder: "crashed".into(),
            lock_id: Uuid::new_v4(),
            lease_at_ms: 0,
            lease_ms: 10,
            why: "moveChunk".into(),
        };
        assert!(catalog.try_lock(stale, now_millis()).await?.is_ok());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let p1 = manager(&catalog, "p1", 1_000);
        let guard = p1.lock("db.c", "recover", None).await?;
        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(catalog.get_lock("db.c").await?.is_none());
        Ok(())
    }
}
