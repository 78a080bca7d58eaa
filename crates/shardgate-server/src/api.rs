//! HTTP surface of the router role: client reads and writes, admin commands
//! served by the coordinator, and the catalog endpoint shard processes use.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use shardgate_core::catalog::{self, CatalogReply, CatalogRequest, DatabaseEntry, ShardEntry};
use shardgate_core::coordinator::AutoSplitOutcome;
use shardgate_core::query::Collation;
use shardgate_core::range_deleter::RangeDeletionReport;
use shardgate_core::{
    Balancer, ChunkVersion, CommandRequest, ConnectionString, Coordinator, FindReply, FindRequest, GetMoreRequest,
    InsertReply, KeyRange, KillCursorsReply, MigrationOutcome, MoveChunkOptions, Namespace, OperationContext,
    RemoveShardStatus, ShardId, ShardKey, ShardKeyPattern, ShardgateError,
};

use crate::auth::{auth_middleware, AuthConfig};
use crate::error::{ApiError, ApiResponse};
use crate::remote::CATALOG_RPC_PATH;

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Clone)]
pub struct RouterState {
    pub coordinator: Arc<Coordinator>,
    pub balancer: Arc<Balancer>,
}

impl RouterState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            balancer: Arc::new(Balancer::new(coordinator.clone())),
            coordinator,
        }
    }

    fn router(&self) -> &shardgate_core::Router {
        self.coordinator.router()
    }

    fn ctx(&self) -> OperationContext {
        OperationContext::with_timeout(self.router().params().default_op_timeout)
    }

    /// Parse JSON bounds against the shard key of `ns`.
    async fn keys(&self, ns: &Namespace, values: &[Value]) -> Result<Vec<ShardKey>, ApiError> {
        let entry = self
            .router()
            .catalog()
            .get_collection(ns)
            .await?
            .filter(|c| !c.dropped)
            .ok_or_else(|| ShardgateError::NamespaceNotFound(format!("{ns} is not sharded")))?;
        Ok(values
            .iter()
            .map(|v| entry.key_pattern.parse_key(v))
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn key(&self, ns: &Namespace, value: &Value) -> Result<ShardKey, ApiError> {
        let mut keys = self.keys(ns, std::slice::from_ref(value)).await?;
        keys.pop()
            .ok_or_else(|| ApiError::Core(ShardgateError::BadValue("missing key".to_string())))
    }
}

pub fn router_app(state: RouterState, auth: Arc<AuthConfig>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/find", post(find))
        .route("/v1/getMore", post(get_more))
        .route("/v1/killCursors", post(kill_cursors))
        .route("/v1/insert", post(insert))
        .route("/v1/command/:db", post(command))
        .route("/v1/admin/shards", get(list_shards))
        .route("/v1/admin/shards", post(add_shard))
        .route("/v1/admin/shards/:id", delete(remove_shard))
        .route("/v1/admin/databases", get(list_databases))
        .route("/v1/admin/databases", post(create_database))
        .route("/v1/admin/movePrimary", post(move_primary))
        .route("/v1/admin/shardCollection", post(shard_collection))
        .route("/v1/admin/split", post(split))
        .route("/v1/admin/autoSplit", post(auto_split))
        .route("/v1/admin/mergeChunks", post(merge_chunks))
        .route("/v1/admin/moveChunk", post(move_chunk))
        .route("/v1/admin/refineShardKey", post(refine_shard_key))
        .route("/v1/admin/drop", post(drop_collection))
        .route("/v1/admin/rename", post(rename_collection))
        .route("/v1/admin/zones", post(assign_zone))
        .route("/v1/admin/balance", post(balance))
        .route("/v1/admin/cleanup", post(cleanup))
        .route("/v1/admin/routing/:ns", get(routing))
        .route(CATALOG_RPC_PATH, post(catalog_rpc))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn find(State(state): State<RouterState>, Json(request): Json<FindRequest>) -> ApiResult<FindReply> {
    let reply = state.router().find(&state.ctx(), request).await?;
    Ok(ApiResponse::ok(reply))
}

async fn get_more(State(state): State<RouterState>, Json(request): Json<GetMoreRequest>) -> ApiResult<FindReply> {
    let reply = state.router().get_more(&state.ctx(), request).await?;
    Ok(ApiResponse::ok(reply))
}

#[derive(Deserialize)]
struct KillCursorsInput {
    ns: Namespace,
    cursor_ids: Vec<u64>,
}

async fn kill_cursors(State(state): State<RouterState>, Json(input): Json<KillCursorsInput>) -> ApiResult<KillCursorsReply> {
    Ok(ApiResponse::ok(state.router().kill_cursors(&input.ns, &input.cursor_ids)))
}

#[derive(Deserialize)]
struct InsertInput {
    ns: Namespace,
    documents: Vec<Value>,
}

async fn insert(State(state): State<RouterState>, Json(input): Json<InsertInput>) -> ApiResult<InsertReply> {
    let reply = state.router().insert(&state.ctx(), &input.ns, input.documents).await?;
    Ok(ApiResponse::ok(reply))
}

async fn command(
    State(state): State<RouterState>,
    Path(db): Path<String>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Value> {
    let reply = state.router().run_command(&state.ctx(), &db, request).await?;
    Ok(ApiResponse::ok(reply))
}

async fn list_shards(State(state): State<RouterState>) -> ApiResult<Vec<ShardEntry>> {
    Ok(ApiResponse::ok(state.router().catalog().list_shards().await?))
}

#[derive(Deserialize)]
struct AddShardInput {
    id: String,
    /// `host:port` or `set/host1:port,host2:port`.
    host: String,
    #[serde(default)]
    max_size_bytes: u64,
}

async fn add_shard(State(state): State<RouterState>, Json(input): Json<AddShardInput>) -> ApiResult<ShardEntry> {
    let conn = ConnectionString::parse(&input.host)?;
    let entry = state
        .coordinator
        .add_shard(&state.ctx(), ShardId::new(input.id), conn, input.max_size_bytes)
        .await?;
    Ok(ApiResponse::ok(entry))
}

async fn remove_shard(State(state): State<RouterState>, Path(id): Path<String>) -> ApiResult<RemoveShardStatus> {
    Ok(ApiResponse::ok(state.coordinator.remove_shard(&ShardId::new(id)).await?))
}

async fn list_databases(State(state): State<RouterState>) -> ApiResult<Vec<DatabaseEntry>> {
    Ok(ApiResponse::ok(state.router().catalog().list_databases().await?))
}

#[derive(Deserialize)]
struct DatabaseInput {
    db: String,
    #[serde(default)]
    primary: Option<String>,
    #[serde(default)]
    sharding: bool,
}

async fn create_database(State(state): State<RouterState>, Json(input): Json<DatabaseInput>) -> ApiResult<DatabaseEntry> {
    let primary = input.primary.map(ShardId::new);
    let entry = if input.sharding {
        state.coordinator.enable_sharding(&input.db, primary).await?
    } else {
        state.coordinator.create_database(&input.db, primary).await?
    };
    Ok(ApiResponse::ok(entry))
}

#[derive(Deserialize)]
struct MovePrimaryInput {
    db: String,
    to: String,
}

async fn move_primary(State(state): State<RouterState>, Json(input): Json<MovePrimaryInput>) -> ApiResult<DatabaseEntry> {
    let entry = state
        .coordinator
        .move_primary(&state.ctx(), &input.db, &ShardId::new(input.to))
        .await?;
    Ok(ApiResponse::ok(entry))
}

#[derive(Deserialize)]
struct ShardCollectionInput {
    ns: String,
    key: Value,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    split_points: Vec<Value>,
    #[serde(default)]
    collation: Option<Collation>,
}

async fn shard_collection(
    State(state): State<RouterState>,
    Json(input): Json<ShardCollectionInput>,
) -> ApiResult<ChunkVersion> {
    let ns = Namespace::parse(&input.ns)?;
    let pattern = ShardKeyPattern::from_json(&input.key)?;
    let points = input
        .split_points
        .iter()
        .map(|p| pattern.parse_key(p))
        .collect::<Result<Vec<_>, _>>()?;
    let version = state
        .coordinator
        .shard_collection(&state.ctx(), &ns, pattern, input.unique, points, input.collation)
        .await?;
    Ok(ApiResponse::ok(version))
}

#[derive(Deserialize)]
struct SplitInput {
    ns: String,
    /// Any key inside the chunk to split.
    find: Value,
    points: Vec<Value>,
}

async fn split(State(state): State<RouterState>, Json(input): Json<SplitInput>) -> ApiResult<ChunkVersion> {
    let ns = Namespace::parse(&input.ns)?;
    let key = state.key(&ns, &input.find).await?;
    let points = state.keys(&ns, &input.points).await?;
    let version = state.coordinator.split_chunk(&state.ctx(), &ns, &key, points).await?;
    Ok(ApiResponse::ok(version))
}

#[derive(Deserialize)]
struct AutoSplitInput {
    ns: String,
    find: Value,
}

async fn auto_split(State(state): State<RouterState>, Json(input): Json<AutoSplitInput>) -> ApiResult<AutoSplitOutcome> {
    let ns = Namespace::parse(&input.ns)?;
    let key = state.key(&ns, &input.find).await?;
    Ok(ApiResponse::ok(state.coordinator.auto_split(&state.ctx(), &ns, &key).await?))
}

#[derive(Deserialize)]
struct RangeInput {
    ns: String,
    min: Value,
    max: Value,
}

async fn merge_chunks(State(state): State<RouterState>, Json(input): Json<RangeInput>) -> ApiResult<ChunkVersion> {
    let ns = Namespace::parse(&input.ns)?;
    let min = state.key(&ns, &input.min).await?;
    let max = state.key(&ns, &input.max).await?;
    let version = state.coordinator.merge_chunks(&state.ctx(), &ns, min, max).await?;
    Ok(ApiResponse::ok(version))
}

#[derive(Deserialize)]
struct MoveChunkInput {
    ns: String,
    find: Value,
    to: String,
    #[serde(default)]
    force_jumbo: bool,
    #[serde(default)]
    wait_for_delete: bool,
}

async fn move_chunk(State(state): State<RouterState>, Json(input): Json<MoveChunkInput>) -> ApiResult<MigrationOutcome> {
    let ns = Namespace::parse(&input.ns)?;
    let key = state.key(&ns, &input.find).await?;
    let options = MoveChunkOptions {
        force_jumbo: input.force_jumbo,
        wait_for_delete: input.wait_for_delete,
    };
    let outcome = state
        .coordinator
        .move_chunk(&state.ctx(), &ns, &key, &ShardId::new(input.to), options)
        .await?;
    Ok(ApiResponse::ok(outcome))
}

#[derive(Deserialize)]
struct RefineInput {
    ns: String,
    key: Value,
}

async fn refine_shard_key(State(state): State<RouterState>, Json(input): Json<RefineInput>) -> ApiResult<ChunkVersion> {
    let ns = Namespace::parse(&input.ns)?;
    let pattern = ShardKeyPattern::from_json(&input.key)?;
    let version = state.coordinator.refine_shard_key(&state.ctx(), &ns, pattern).await?;
    Ok(ApiResponse::ok(version))
}

#[derive(Deserialize)]
struct NsInput {
    ns: String,
}

async fn drop_collection(State(state): State<RouterState>, Json(input): Json<NsInput>) -> ApiResult<&'static str> {
    let ns = Namespace::parse(&input.ns)?;
    state.coordinator.drop_collection(&state.ctx(), &ns).await?;
    Ok(ApiResponse::ok("dropped"))
}

#[derive(Deserialize)]
struct RenameInput {
    from: String,
    to: String,
    #[serde(default)]
    drop_target: bool,
}

async fn rename_collection(State(state): State<RouterState>, Json(input): Json<RenameInput>) -> ApiResult<&'static str> {
    let from = Namespace::parse(&input.from)?;
    let to = Namespace::parse(&input.to)?;
    state
        .coordinator
        .rename_collection(&state.ctx(), &from, &to, input.drop_target)
        .await?;
    Ok(ApiResponse::ok("renamed"))
}

#[derive(Deserialize)]
struct ZoneInput {
    ns: String,
    min: Value,
    max: Value,
    zone: String,
}

async fn assign_zone(State(state): State<RouterState>, Json(input): Json<ZoneInput>) -> ApiResult<&'static str> {
    let ns = Namespace::parse(&input.ns)?;
    let min = state.key(&ns, &input.min).await?;
    let max = state.key(&ns, &input.max).await?;
    state
        .coordinator
        .assign_zone_range(&ns, KeyRange::new(min, max)?, &input.zone)
        .await?;
    Ok(ApiResponse::ok("assigned"))
}

async fn balance(State(state): State<RouterState>) -> ApiResult<Vec<MigrationOutcome>> {
    Ok(ApiResponse::ok(state.balancer.balance_round().await?))
}

async fn cleanup(State(state): State<RouterState>) -> ApiResult<RangeDeletionReport> {
    Ok(ApiResponse::ok(state.coordinator.range_deleter().run_once().await?))
}

async fn routing(State(state): State<RouterState>, Path(ns): Path<String>) -> ApiResult<Value> {
    let ns = Namespace::parse(&ns)?;
    Ok(ApiResponse::ok(state.router().describe_routing(&ns).await?))
}

async fn catalog_rpc(
    State(state): State<RouterState>,
    Json(request): Json<CatalogRequest>,
) -> Json<Result<CatalogReply, ShardgateError>> {
    Json(catalog::dispatch(state.router().catalog().as_ref(), request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::json;
    use shardgate_core::LocalCluster;
    use tower::ServiceExt;

    async fn app(auth: AuthConfig) -> anyhow::Result<(LocalCluster, Router)> {
        let cluster = LocalCluster::start(2).await?;
        let app = router_app(RouterState::new(cluster.coordinator.clone()), Arc::new(auth));
        Ok((cluster, app))
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Value) -> anyhow::Result<(StatusCode, Value)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = if method == "GET" { Body::empty() } else { Body::from(body.to_string()) };
        let response = app.clone().oneshot(builder.body(body)?).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes)? };
        Ok((status, value))
    }

    #[tokio::test]
    async fn shard_insert_and_find_over_http() -> anyhow::Result<()> {
        let (_cluster, app) = app(AuthConfig::default()).await?;
        let (status, _) = call(&app, "POST", "/v1/admin/databases", None, json!({"db": "shop", "sharding": true})).await?;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(
            &app,
            "POST",
            "/v1/admin/shardCollection",
            None,
            json!({"ns": "shop.orders", "key": {"sku": 1}, "split_points": [{"sku": 100}]}),
        )
        .await?;
        assert_eq!(status, StatusCode::OK, "{body}");

        let docs: Vec<Value> = (95..105).map(|i| json!({"sku": i})).collect();
        let ns = json!({"db": "shop", "coll": "orders"});
        let (status, body) = call(&app, "POST", "/v1/insert", None, json!({"ns": ns, "documents": docs})).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["n"], json!(10));

        let (status, body) = call(
            &app,
            "POST",
            "/v1/find",
            None,
            json!({"ns": ns, "filter": {"sku": {"$gte": 100}}, "sort": {"sku": 1}}),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        let skus: Vec<i64> = body["data"]["batch"]
            .as_array()
            .map(|b| b.iter().filter_map(|d| d["sku"].as_i64()).collect())
            .unwrap_or_default();
        assert_eq!(skus, vec![100, 101, 102, 103, 104]);

        let (status, body) = call(&app, "GET", "/v1/admin/routing/shop.orders", None, Value::Null).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["chunks"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn core_errors_map_to_status_codes() -> anyhow::Result<()> {
        let (_cluster, app) = app(AuthConfig::default()).await?;
        let (status, body) = call(&app, "GET", "/v1/admin/routing/nowhere.c", None, Value::Null).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["code"], json!("NamespaceNotFound"));

        let (status, _) = call(&app, "GET", "/v1/admin/routing/no-dot", None, Value::Null).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn tokens_gate_reads_and_admin_calls() -> anyhow::Result<()> {
        let (_cluster, app) = app(AuthConfig::new(Some("admin".into()), Some("reader".into()))).await?;
        let (status, _) = call(&app, "GET", "/healthz", None, Value::Null).await?;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", "/v1/admin/shards", None, Value::Null).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = call(&app, "GET", "/v1/admin/shards", Some("reader"), Value::Null).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
        let (status, _) = call(&app, "POST", "/v1/admin/databases", Some("reader"), json!({"db": "x"})).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "POST", "/v1/admin/databases", Some("admin"), json!({"db": "x"})).await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn catalog_rpc_returns_serialized_results() -> anyhow::Result<()> {
        let (_cluster, app) = app(AuthConfig::default()).await?;
        let (status, body) = call(&app, "POST", CATALOG_RPC_PATH, None, json!({"op": "listShards"})).await?;
        assert_eq!(status, StatusCode::OK);
        let reply: Result<CatalogReply, ShardgateError> = serde_json::from_value(body)?;
        assert!(matches!(reply, Ok(CatalogReply::Shards(s)) if s.len() == 2));

        let (_, body) = call(&app, "POST", CATALOG_RPC_PATH, None, json!({"op": "getDatabase", "name": "missing"})).await?;
        let reply: Result<CatalogReply, ShardgateError> = serde_json::from_value(body)?;
        assert!(matches!(reply, Err(ShardgateError::NamespaceNotFound(_))));
        Ok(())
    }
}
