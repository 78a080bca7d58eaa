//! HTTP surface of the shard role: one endpoint executing shard commands
//! against the reference shard node.

use std::sync::Arc;

use axum::{extract::State, middleware, routing::get, routing::post, Json, Router};
use shardgate_core::{InMemoryShard, ShardRequest, ShardResponse, ShardgateError};

use crate::auth::{auth_middleware, AuthConfig};
use crate::remote::SHARD_COMMAND_PATH;

pub fn shard_app(node: Arc<InMemoryShard>, auth: Arc<AuthConfig>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route(SHARD_COMMAND_PATH, post(command))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(node)
}

async fn health() -> &'static str {
    "ok"
}

async fn command(
    State(node): State<Arc<InMemoryShard>>,
    Json(request): Json<ShardRequest>,
) -> Json<Result<ShardResponse, ShardgateError>> {
    tracing::debug!(shard = %node.id(), ns = %request.ns, command = request.command.name(), "shard command");
    Json(node.handle(request).await)
}
