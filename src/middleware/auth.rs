use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::utils::{ApiError, JwtUtil};

#[derive(Clone)]
pub struct AuthState {
    pub jwt_util: Arc<JwtUtil>,
}

/// Identity bound to a request after JWT verification (C1). Handlers pull
/// this via `Extension<AuthContext>` and pass `.user_id` into
/// `Db::with_user_transaction`.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
    pub is_admin: bool,
}

/// Verifies the bearer token and attaches an `AuthContext` to the request.
/// Does not itself open a database transaction -- RLS scoping happens inside
/// handlers via `Db::with_user_transaction(ctx.user_id, ...)`.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let uri = req.uri().path().to_string();
    let method = req.method().clone();

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;

    let claims = state.jwt_util.verify_token(token).map_err(|err| {
        tracing::warn!("jwt verification failed for {} {}: {:?}", method, uri, err);
        err
    })?;

    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| ApiError::unauthorized("malformed subject claim"))?;

    let ctx = AuthContext { user_id, username: claims.username, is_admin: claims.is_admin };
    req.extensions_mut().insert(ctx);

    Ok(next.run(req).await)
}

/// Gate for admin-only routes (catalog maintenance, analyte approval). Must
/// run after `auth_middleware` so the extension is present.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, ApiError> {
    let ctx = req
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or_else(|| ApiError::unauthorized("missing auth context"))?;

    if !ctx.is_admin {
        return Err(ApiError::forbidden("admin role required"));
    }

    Ok(next.run(req).await)
}
