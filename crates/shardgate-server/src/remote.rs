//! reqwest clients for the two internal endpoints: shard commands and
//! catalog calls. Both reply with a serialized `Result` so shard and catalog
//! errors reach the router unchanged.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardgate_core::catalog::{CatalogChannel, CatalogReply, CatalogRequest};
use shardgate_core::{HostAndPort, Result, ShardRequest, ShardResponse, ShardTransport, ShardgateError};

pub const SHARD_COMMAND_PATH: &str = "/v1/shard/command";
pub const CATALOG_RPC_PATH: &str = "/v1/catalog/rpc";

#[derive(Clone)]
struct JsonClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl JsonClient {
    fn new(token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ShardgateError::Internal(format!("http client: {e}")))?;
        Ok(Self { http, token })
    }

    async fn call<B: Serialize, R: DeserializeOwned>(&self, url: &str, body: &B) -> Result<R> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ShardgateError::NetworkTimeout(format!("{url}: {e}"))
            } else {
                ShardgateError::HostUnreachable(format!("{url}: {e}"))
            }
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ShardgateError::Unauthorized(format!("{url} answered {status}")));
        }
        if !status.is_success() {
            return Err(ShardgateError::CommandFailed(format!("{url} answered {status}")));
        }
        let reply: std::result::Result<R, ShardgateError> = response
            .json()
            .await
            .map_err(|e| ShardgateError::Serialization(format!("{url}: {e}")))?;
        reply
    }
}

/// Sends shard commands to `http://<host>:<port>/v1/shard/command`.
#[derive(Clone)]
pub struct HttpTransport {
    client: JsonClient,
}

impl HttpTransport {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(token, timeout)?,
        })
    }
}

#[async_trait]
impl ShardTransport for HttpTransport {
    async fn send(&self, host: &HostAndPort, request: ShardRequest) -> Result<ShardResponse> {
        let url = format!("http://{host}{SHARD_COMMAND_PATH}");
        self.client.call(&url, &request).await
    }
}

/// Carries catalog calls to the router process that owns the catalog.
#[derive(Clone)]
pub struct HttpCatalogChannel {
    client: JsonClient,
    url: String,
}

impl HttpCatalogChannel {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(token, timeout)?,
            url: format!("{}{CATALOG_RPC_PATH}", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl CatalogChannel for HttpCatalogChannel {
    async fn call(&self, request: CatalogRequest) -> Result<CatalogReply> {
        self.client.call(&self.url, &request).await
    }
}
