pub mod api;
pub mod auth;
pub mod error;
pub mod remote;
pub mod shard_api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use shardgate_core::catalog::{CatalogClient, RemoteCatalog};
use shardgate_core::{
    ClusterClock, ClusterParams, Coordinator, InMemoryCatalog, InMemoryShard, Router, ShardId, ShardTransport,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::api::{router_app, RouterState};
use crate::auth::AuthConfig;
use crate::remote::{HttpCatalogChannel, HttpTransport};
use crate::shard_api::shard_app;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerRole {
    /// Router, coordinator and catalog in one process.
    Router,
    /// Reference shard node.
    Shard,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub role: ServerRole,
    pub listen: SocketAddr,
    /// Catalog journal directory (router role). In-memory only when unset.
    pub data_dir: Option<PathBuf>,
    pub shard_id: Option<String>,
    /// Router base URL a shard process reads the catalog from.
    pub catalog_url: Option<String>,
    pub token: Option<String>,
    pub read_token: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub params: ClusterParams,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let role = match std::env::var("SHARDGATE_ROLE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "" | "router" => ServerRole::Router,
            "shard" => ServerRole::Shard,
            other => anyhow::bail!("unknown SHARDGATE_ROLE '{other}', expected router or shard"),
        };
        let listen = std::env::var("SHARDGATE_LISTEN")
            .unwrap_or_else(|_| "0.0.0.0:27017".into())
            .parse()
            .context("SHARDGATE_LISTEN")?;
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Ok(Self {
            role,
            listen,
            data_dir: var("SHARDGATE_DATA").map(PathBuf::from),
            shard_id: var("SHARDGATE_SHARD_ID"),
            catalog_url: var("SHARDGATE_CATALOG_URL"),
            token: var("SHARDGATE_TOKEN"),
            read_token: var("SHARDGATE_READ_TOKEN"),
            log_dir: var("SHARDGATE_LOG_DIR").map(PathBuf::from),
            params: ClusterParams::from_env(),
        })
    }
}

/// Console logging filtered by `RUST_LOG`, plus a daily file when `log_dir`
/// is set. Keep the guard alive for the life of the process.
pub fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shardgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            None
        }
    }
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    let _guard = init_tracing(config.log_dir.as_ref());
    serve(config).await
}

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let app = match config.role {
        ServerRole::Router => build_router_role(&config, &cancel).await?,
        ServerRole::Shard => build_shard_role(&config)?,
    };

    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!(addr = %config.listen, role = ?config.role, "listening");
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

async fn build_router_role(config: &ServerConfig, cancel: &CancellationToken) -> anyhow::Result<axum::Router> {
    let params = config.params.clone();
    let catalog = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(InMemoryCatalog::open(dir)?)
        }
        None => Arc::new(InMemoryCatalog::new()),
    };
    let catalog: Arc<dyn CatalogClient> = catalog;
    let transport: Arc<dyn ShardTransport> =
        Arc::new(HttpTransport::new(config.token.clone(), params.default_op_timeout)?);
    let router = Router::start(catalog, transport.clone(), params.clone()).await?;
    let coordinator = Arc::new(Coordinator::new(
        router.clone(),
        Arc::new(ClusterClock::new()),
        format!("router-{}", config.listen),
    ));

    let report = coordinator.recover().await?;
    if !report.completed.is_empty() || !report.aborted.is_empty() {
        tracing::info!(
            completed = report.completed.len(),
            aborted = report.aborted.len(),
            "recovered unfinished migrations"
        );
    }

    let state = RouterState::new(coordinator.clone());
    router
        .registry()
        .spawn_host_monitor(transport, params.host_monitor_interval, cancel.clone());
    router.spawn_cursor_reaper(params.default_op_timeout * 20, cancel.clone());
    state.balancer.clone().spawn(params.balancer_interval, cancel.clone());
    Arc::new(shardgate_core::RangeDeleter::new(router.clone())).spawn(params.range_deleter_interval, cancel.clone());

    let auth = Arc::new(AuthConfig::new(config.token.clone(), config.read_token.clone()));
    Ok(router_app(state, auth))
}

fn build_shard_role(config: &ServerConfig) -> anyhow::Result<axum::Router> {
    let id = config
        .shard_id
        .clone()
        .context("SHARDGATE_SHARD_ID is required for the shard role")?;
    let url = config
        .catalog_url
        .clone()
        .context("SHARDGATE_CATALOG_URL is required for the shard role")?;
    let channel = HttpCatalogChannel::new(&url, config.token.clone(), config.params.default_op_timeout)?;
    let catalog: Arc<dyn CatalogClient> = Arc::new(RemoteCatalog::new(channel));
    let node = Arc::new(InMemoryShard::new(
        ShardId::new(id),
        catalog,
        Arc::new(ClusterClock::new()),
        config.params.clone(),
    ));
    let auth = Arc::new(AuthConfig::new(config.token.clone(), config.read_token.clone()));
    Ok(shard_app(node, auth))
}
