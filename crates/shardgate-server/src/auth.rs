use std::sync::Arc;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};

use crate::error::ApiError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    Read,
}

/// Bearer tokens. With no admin token configured every request passes.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub admin_token: Option<String>,
    pub read_token: Option<String>,
}

impl AuthConfig {
    pub fn new(admin_token: Option<String>, read_token: Option<String>) -> Self {
        Self {
            admin_token: admin_token.filter(|t| !t.is_empty()),
            read_token: read_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.admin_token.is_some()
    }

    fn role_for(&self, token: &str) -> Option<Role> {
        if self.admin_token.as_deref() == Some(token) {
            Some(Role::Admin)
        } else if self.read_token.as_deref() == Some(token) {
            Some(Role::Read)
        } else {
            None
        }
    }
}

pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if !auth.enabled() || path == "/healthz" {
        return Ok(next.run(req).await);
    }
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(role) = token.and_then(|t| auth.role_for(t)) else {
        return Err(ApiError::Unauthorized);
    };
    if authorize(role, path, req.method().as_str()) {
        let mut req = req;
        req.extensions_mut().insert(role);
        Ok(next.run(req).await)
    } else {
        Err(ApiError::Forbidden)
    }
}

fn authorize(role: Role, path: &str, method: &str) -> bool {
    match role {
        Role::Admin => true,
        Role::Read => is_read_path(path, method),
    }
}

/// Requests a read-only token may make. Cursor traffic counts as reading;
/// internal cluster endpoints never do.
fn is_read_path(path: &str, method: &str) -> bool {
    if path.starts_with("/v1/shard/") || path.starts_with("/v1/catalog/") {
        return false;
    }
    if method.eq_ignore_ascii_case("GET") {
        return true;
    }
    matches!(path, "/v1/find" | "/v1/getMore" | "/v1/killCursors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_tokens_only_read() {
        assert!(authorize(Role::Read, "/v1/find", "POST"));
        assert!(authorize(Role::Read, "/v1/admin/routing/db.c", "GET"));
        assert!(!authorize(Role::Read, "/v1/insert", "POST"));
        assert!(!authorize(Role::Read, "/v1/admin/moveChunk", "POST"));
        assert!(!authorize(Role::Read, "/v1/catalog/rpc", "POST"));
        assert!(authorize(Role::Admin, "/v1/catalog/rpc", "POST"));
    }

    #[test]
    fn empty_tokens_disable_auth() {
        let auth = AuthConfig::new(Some(String::new()), Some("r".into()));
        assert!(!auth.enabled());
        let auth = AuthConfig::new(Some("a".into()), Some("r".into()));
        assert_eq!(auth.role_for("a"), Some(Role::Admin));
        assert_eq!(auth.role_for("r"), Some(Role::Read));
        assert_eq!(auth.role_for("x"), None);
    }
}
