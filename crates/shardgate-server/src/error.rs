use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use shardgate_core::{ErrorCode, ShardgateError};

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self { ok: true, data })
    }
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    code: ErrorCode,
    message: String,
    error: ShardgateError,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    Core(ShardgateError),
}

impl From<ShardgateError> for ApiError {
    fn from(value: ShardgateError) -> Self {
        ApiError::Core(value)
    }
}

pub fn status_for(err: &ShardgateError) -> StatusCode {
    use ShardgateError::*;
    match err {
        NamespaceNotFound(_) | ShardNotFound(_) | CursorNotFound(_) | NoMatchingDocument(_) => StatusCode::NOT_FOUND,
        BadValue(_) | KeyOutOfRange(_) | IllegalOperation(_) | Serialization(_) => StatusCode::BAD_REQUEST,
        StaleShardVersion { .. } | StaleEpoch { .. } | ConflictingOperationInProgress(_) => StatusCode::CONFLICT,
        ChunkTooBig(_) | CommandFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Unauthorized(_) => StatusCode::FORBIDDEN,
        HostUnreachable(_) | NetworkTimeout(_) | NotMaster(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExceededTimeLimit => StatusCode::GATEWAY_TIMEOUT,
        Interrupted | CallbackCanceled | QueryPlanKilled(_) | CursorKilled => StatusCode::GONE,
        InconsistentChunkMap(_) | Io(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            ApiError::Forbidden => StatusCode::FORBIDDEN.into_response(),
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(code = ?err.code(), error = %err, "request failed");
                } else {
                    tracing::debug!(code = ?err.code(), error = %err, "request rejected");
                }
                let body = ErrorBody {
                    ok: false,
                    code: err.code(),
                    message: err.to_string(),
                    error: err,
                };
                (status, Json(body)).into_response()
            }
        }
    }
}
