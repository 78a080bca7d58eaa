//! Fan-out of shard requests. Each target gets its own task that resolves
//! a host, attaches the request's chunk version, holds a pool permit while
//! the request is in flight and retries retriable network errors within
//! the operation deadline. Responses, failures included, are handed back as
//! values; stale routing errors pass through untouched for the caller to
//! act on.

use crate::config::ClusterParams;
use crate::error::{Result, ShardgateError};
use crate::namespace::ShardId;
use crate::op_context::OperationContext;
use crate::pool::ConnectionPools;
use crate::registry::{HostAndPort, ShardRegistry};
use crate::targeter::{HostObservation, ReadPreference};
use crate::transport::{ShardCommand, ShardRequest, ShardResponse, ShardTransport};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which retriable network errors may be retried for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Never,
    /// Any retriable error, if the command is safe to repeat.
    Idempotent,
    /// Only errors proving the command was not applied.
    NotMasterOnly,
}

impl RetryPolicy {
    fn allows(&self, error: &ShardgateError, command: &ShardCommand) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Idempotent => error.is_retriable_network() && command.is_idempotent(),
            RetryPolicy::NotMasterOnly => error.is_not_master(),
        }
    }
}

/// Everything needed to reach a shard. Cheap to clone.
#[derive(Clone)]
pub struct ShardClient {
    registry: Arc<ShardRegistry>,
    transport: Arc<dyn ShardTransport>,
    pools: Arc<ConnectionPools>,
    params: Arc<ClusterParams>,
}

impl ShardClient {
    pub fn new(
        registry: Arc<ShardRegistry>,
        transport: Arc<dyn ShardTransport>,
        pools: Arc<ConnectionPools>,
        params: Arc<ClusterParams>,
    ) -> Self {
        Self {
            registry,
            transport,
            pools,
            params,
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .params
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.params.backoff_cap);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        exp.mul_f64(jitter)
    }

    /// One attempt against one host, bounded by `deadline`.
    pub async fn send_to_host(&self, host: &HostAndPort, request: ShardRequest, deadline: Instant) -> Result<ShardResponse> {
        let _permit = tokio::time::timeout_at(deadline, self.pools.acquire(host))
            .await
            .map_err(|_| ShardgateError::NetworkTimeout(format!("waiting for a connection to {host}")))??;
        tokio::time::timeout_at(deadline, self.transport.send(host, request))
            .await
            .map_err(|_| ShardgateError::NetworkTimeout(host.to_string()))?
    }

    /// Send to whichever host of `shard` matches `pref`, retrying under
    /// `policy`. Returns the host that answered.
    pub async fn send_to_shard(
        &self,
        ctx: &OperationContext,
        shard: &ShardId,
        request: ShardRequest,
        pref: ReadPreference,
        policy: RetryPolicy,
    ) -> Result<(HostAndPort, ShardResponse)> {
        let target = self.registry.get_shard(shard)?;
        let targeter = target.targeter().clone();
        let deadline = ctx.deadline_or(self.params.default_op_timeout);
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check_for_interrupt()?;
            let host = targeter.find_host(pref, deadline).await?;
            match self.send_to_host(&host, request.clone(), deadline).await {
                Ok(response) => {
                    let seen = if pref == ReadPreference::PrimaryOnly {
                        HostObservation::Primary
                    } else {
                        HostObservation::Reachable
                    };
                    targeter.on_response(&host, seen);
                    return Ok((host, response));
                }
                Err(e) => {
                    if e.is_not_master() {
                        targeter.on_response(&host, HostObservation::NotMaster);
                    } else if e.is_retriable_network() {
                        targeter.on_response(&host, HostObservation::NetworkError);
                    }
                    let retry = policy.allows(&e, &request.command)
                        && attempt < self.params.network_attempts
                        && Instant::now() < deadline;
                    if !retry {
                        return Err(e);
                    }
                    let pause = self.backoff(attempt);
                    debug!(%shard, %host, attempt, error = %e, ?pause, "retrying shard request");
                    tokio::time::sleep_until((Instant::now() + pause).min(deadline)).await;
                }
            }
        }
    }
}

/// One target of a fan-out.
#[derive(Debug, Clone)]
pub struct AsyncRequest {
    pub shard: ShardId,
    pub request: ShardRequest,
}

#[derive(Debug, Clone)]
pub struct AsyncResponse {
    pub shard: ShardId,
    /// Host that produced the response, when one was reached.
    pub host: Option<HostAndPort>,
    pub result: Result<ShardResponse>,
}

/// Sends a batch of requests concurrently and yields one response per
/// target, in completion order.
pub struct AsyncRequestsSender {
    rx: mpsc::UnboundedReceiver<AsyncResponse>,
    remaining: usize,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AsyncRequestsSender {
    pub fn new(
        client: &ShardClient,
        ctx: &OperationContext,
        requests: Vec<AsyncRequest>,
        pref: ReadPreference,
        policy: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = ctx.cancel_token().child_token();
        let remaining = requests.len();
        let tasks = requests
            .into_iter()
            .map(|AsyncRequest { shard, request }| {
                let client = client.clone();
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => Err(ShardgateError::CallbackCanceled),
                        res = client.send_to_shard(&ctx, &shard, request, pref, policy) => res,
                    };
                    let (host, result) = match outcome {
                        Ok((host, response)) => (Some(host), Ok(response)),
                        Err(e) => (None, Err(e)),
                    };
                    let _ = tx.send(AsyncResponse { shard, host, result });
                })
            })
            .collect();
        Self {
            rx,
            remaining,
            cancel,
            tasks,
        }
    }

    pub fn done(&self) -> bool {
        self.remaining == 0
    }

    pub async fn next(&mut self) -> Option<AsyncResponse> {
        if self.remaining == 0 {
            return None;
        }
        let response = self.rx.recv().await?;
        self.remaining -= 1;
        Some(response)
    }

    pub async fn collect_all(mut self) -> Vec<AsyncResponse> {
        let mut out = Vec::with_capacity(self.remaining);
        while let Some(response) = self.next().await {
            out.push(response);
        }
        out
    }

    /// Abort unfinished targets; each reports `CallbackCanceled`.
    pub fn cancel(&self) {
        if self.remaining > 0 {
            warn!(remaining = self.remaining, "cancelling outstanding shard requests");
        }
        self.cancel.cancel();
    }
}

impl Drop for AsyncRequestsSender {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ShardEntry;
    use crate::catalog_store::InMemoryCatalog;
    use crate::clock::ClusterClock;
    use crate::namespace::Namespace;
    use crate::registry::ConnectionString;
    use crate::shard_node::InMemoryShard;
    use crate::transport::{Fault, LocalTransport};

    struct Harness {
        client: ShardClient,
        transport: Arc<LocalTransport>,
    }

    fn harness() -> Harness {
        let params = ClusterParams::for_tests();
        let catalog = Arc::new(InMemoryCatalog::new());
        let clock = Arc::new(ClusterClock::new());
        let registry = Arc::new(ShardRegistry::new(ConnectionString::parse("cfg:1").unwrap(), params.host_cooldown));
        let transport = Arc::new(LocalTransport::new());
        for (id, host) in [("a", "a:1"), ("b", "b:1")] {
            let conn = ConnectionString::parse(host).unwrap();
            registry
                .add_shard(ShardEntry {
                    id: id.into(),
                    connection_string: conn.clone(),
                    max_size_bytes: 0,
                    draining: false,
                })
                .unwrap();
            let node = Arc::new(InMemoryShard::new(id.into(), catalog.clone(), clock.clone(), params.clone()));
            transport.register(conn.hosts()[0].clone(), node);
        }
        let client = ShardClient::new(
            registry,
            transport.clone(),
            Arc::new(ConnectionPools::new(4)),
            Arc::new(params),
        );
        Harness { client, transport }
    }

    fn hello(shard: &str) -> AsyncRequest {
        AsyncRequest {
            shard: shard.into(),
            request: ShardRequest::new(Namespace::new("admin", "$cmd"), ShardCommand::Hello),
        }
    }

    #[tokio::test]
    async fn collects_one_response_per_target() {
        let h = harness();
        let ctx = OperationContext::with_timeout(Duration::from_secs(2));
        let sender = AsyncRequestsSender::new(
            &h.client,
            &ctx,
            vec![hello("a"), hello("b"), hello("nope")],
            ReadPreference::PrimaryOnly,
            RetryPolicy::Idempotent,
        );
        let mut responses = sender.collect_all().await;
        responses.sort_by(|x, y| x.shard.cmp(&y.shard));
        assert_eq!(responses.len(), 3);
        assert!(responses[0].result.is_ok());
        assert_eq!(responses[0].host, Some(HostAndPort::new("a", 1)));
        assert!(responses[1].result.is_ok());
        assert!(matches!(responses[2].result, Err(ShardgateError::ShardNotFound(_))));
    }

    #[tokio::test]
    async fn retries_network_errors_per_policy() {
        let h = harness();
        let ctx = OperationContext::with_timeout(Duration::from_secs(2));
        let host = HostAndPort::new("a", 1);
        h.transport.inject_fault(Fault {
            host: Some(host.clone()),
            command: None,
            error: ShardgateError::NetworkTimeout("a".into()),
            times: 1,
        });
        let request = hello("a").request;
        let res = h
            .client
            .send_to_shard(&ctx, &"a".into(), request.clone(), ReadPreference::Nearest, RetryPolicy::Idempotent)
            .await;
        assert!(res.is_ok());
        assert_eq!(h.transport.count_for(&host, "hello"), 2);

        h.transport.reset_counters();
        h.transport.inject_fault(Fault {
            host: Some(host.clone()),
            command: None,
            error: ShardgateError::NetworkTimeout("a".into()),
            times: 1,
        });
        let insert = ShardRequest::new(Namespace::new("db", "c"), ShardCommand::Insert { documents: vec![] });
        let res = h
            .client
            .send_to_shard(&ctx, &"a".into(), insert, ReadPreference::PrimaryOnly, RetryPolicy::NotMasterOnly)
            .await;
        assert!(matches!(res, Err(ShardgateError::NetworkTimeout(_))));
        assert_eq!(h.transport.count_for(&host, "insert"), 1);
    }

    #[tokio::test]
    async fn stale_errors_are_not_retried() {
        let h = harness();
        let ctx = OperationContext::new();
        let stale = ShardgateError::StaleShardVersion {
            ns: Namespace::new("db", "c"),
            shard: "a".into(),
            received: crate::version::ChunkVersion::UNSHARDED,
            wanted: None,
        };
        h.transport.inject_fault(Fault {
            host: None,
            command: Some("hello"),
            error: stale.clone(),
            times: 3,
        });
        let res = h
            .client
            .send_to_shard(&ctx, &"a".into(), hello("a").request, ReadPreference::Nearest, RetryPolicy::Idempotent)
            .await;
        assert_eq!(res.map(|_| ()), Err(stale));
        assert_eq!(h.transport.count("hello"), 1);
    }

    #[tokio::test]
    async fn cancel_reports_callback_canceled() {
        let h = harness();
        h.transport.set_delay(HostAndPort::new("b", 1), Duration::from_secs(5));
        let ctx = OperationContext::new();
        let mut sender = AsyncRequestsSender::new(
            &h.client,
            &ctx,
            vec![hello("a"), hello("b")],
            ReadPreference::PrimaryOnly,
            RetryPolicy::Never,
        );
        let first = sender.next().await.expect("first response");
        assert_eq!(first.shard, ShardId::new("a"));
        sender.cancel();
        let second = sender.next().await.expect("second response");
        assert_eq!(second.result.map(|_| ()), Err(ShardgateError::CallbackCanceled));
        assert!(sender.done());
        assert!(sender.next().await.is_none());
    }
}
