use std::str::FromStr;
use std::time::Duration;

/// Tunables shared by the router, coordinator and reference shards.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Whole-operation retries on stale routing for reads.
    pub read_stale_retries: u32,
    /// Whole-operation retries on stale routing for writes.
    pub write_stale_retries: u32,
    /// Attempts per target for retriable network errors.
    pub network_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Used when an operation has no deadline of its own.
    pub default_op_timeout: Duration,
    pub default_batch_size: u32,
    /// Documents a merger may hold per remote before it stops scheduling getMores.
    pub max_buffered_per_remote: usize,
    pub max_connections_per_host: usize,
    pub host_cooldown: Duration,
    pub host_monitor_interval: Duration,
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    /// Seconds of ownership history kept on every chunk.
    pub chunk_history_secs: u32,
    pub await_data_timeout: Duration,
    pub max_chunk_size_bytes: u64,
    pub migration_batch_size: usize,
    /// Chunk-count difference that makes the balancer move a chunk.
    pub balancer_threshold: usize,
    pub balancer_interval: Duration,
    pub range_deleter_interval: Duration,
    pub critical_section_timeout: Duration,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            read_stale_retries: 10,
            write_stale_retries: 4,
            network_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(500),
            default_op_timeout: Duration::from_secs(30),
            default_batch_size: 101,
            max_buffered_per_remote: 1_000,
            max_connections_per_host: 32,
            host_cooldown: Duration::from_secs(1),
            host_monitor_interval: Duration::from_secs(10),
            lock_lease: Duration::from_secs(15),
            lock_wait: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(50),
            chunk_history_secs: 10,
            await_data_timeout: Duration::from_secs(1),
            max_chunk_size_bytes: 64 * 1024 * 1024,
            migration_batch_size: 256,
            balancer_threshold: 2,
            balancer_interval: Duration::from_secs(10),
            range_deleter_interval: Duration::from_secs(1),
            critical_section_timeout: Duration::from_secs(5),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(name, default.as_millis() as u64))
}

impl ClusterParams {
    /// Defaults overridden by `SHARDGATE_*` environment variables. Durations
    /// are given in milliseconds.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            read_stale_retries: env_or("SHARDGATE_READ_STALE_RETRIES", d.read_stale_retries),
            write_stale_retries: env_or("SHARDGATE_WRITE_STALE_RETRIES", d.write_stale_retries),
            network_attempts: env_or("SHARDGATE_NETWORK_ATTEMPTS", d.network_attempts).max(1),
            backoff_base: env_millis("SHARDGATE_BACKOFF_BASE_MS", d.backoff_base),
            backoff_cap: env_millis("SHARDGATE_BACKOFF_CAP_MS", d.backoff_cap),
            default_op_timeout: env_millis("SHARDGATE_OP_TIMEOUT_MS", d.default_op_timeout),
            default_batch_size: env_or("SHARDGATE_BATCH_SIZE", d.default_batch_size).max(1),
            max_buffered_per_remote: env_or("SHARDGATE_MAX_BUFFERED", d.max_buffered_per_remote),
            max_connections_per_host: env_or("SHARDGATE_POOL_SIZE", d.max_connections_per_host),
            host_cooldown: env_millis("SHARDGATE_HOST_COOLDOWN_MS", d.host_cooldown),
            host_monitor_interval: env_millis("SHARDGATE_MONITOR_INTERVAL_MS", d.host_monitor_interval),
            lock_lease: env_millis("SHARDGATE_LOCK_LEASE_MS", d.lock_lease),
            lock_wait: env_millis("SHARDGATE_LOCK_WAIT_MS", d.lock_wait),
            lock_retry_interval: env_millis("SHARDGATE_LOCK_RETRY_MS", d.lock_retry_interval),
            chunk_history_secs: env_or("SHARDGATE_CHUNK_HISTORY_SECS", d.chunk_history_secs),
            await_data_timeout: env_millis("SHARDGATE_AWAIT_DATA_MS", d.await_data_timeout),
            max_chunk_size_bytes: env_or("SHARDGATE_MAX_CHUNK_BYTES", d.max_chunk_size_bytes),
            migration_batch_size: env_or("SHARDGATE_MIGRATION_BATCH", d.migration_batch_size).max(1),
            balancer_threshold: env_or("SHARDGATE_BALANCER_THRESHOLD", d.balancer_threshold).max(1),
            balancer_interval: env_millis("SHARDGATE_BALANCER_INTERVAL_MS", d.balancer_interval),
            range_deleter_interval: env_millis("SHARDGATE_RANGE_DELETER_INTERVAL_MS", d.range_deleter_interval),
            critical_section_timeout: env_millis("SHARDGATE_CRITICAL_SECTION_MS", d.critical_section_timeout),
        }
    }

    /// Settings with short timers, for in-process clusters.
    pub fn for_tests() -> Self {
        Self {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            default_op_timeout: Duration::from_secs(10),
            host_cooldown: Duration::from_millis(50),
            lock_lease: Duration::from_millis(500),
            lock_wait: Duration::from_millis(300),
            lock_retry_interval: Duration::from_millis(10),
            await_data_timeout: Duration::from_millis(50),
            range_deleter_interval: Duration::from_millis(20),
            critical_section_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("SHARDGATE_READ_STALE_RETRIES", "3");
        std::env::set_var("SHARDGATE_LOCK_LEASE_MS", "250");
        std::env::set_var("SHARDGATE_BATCH_SIZE", "not-a-number");
        let p = ClusterParams::from_env();
        assert_eq!(p.read_stale_retries, 3);
        assert_eq!(p.lock_lease, Duration::from_millis(250));
        assert_eq!(p.default_batch_size, 101);
        assert_eq!(p.write_stale_retries, 4);
        std::env::remove_var("SHARDGATE_READ_STALE_RETRIES");
        std::env::remove_var("SHARDGATE_LOCK_LEASE_MS");
        std::env::remove_var("SHARDGATE_BATCH_SIZE");
    }
}
