use std::sync::Arc;

use axum::{Extension, Json, extract::State};
use validator::Validate;

use crate::AppState;
use crate::middleware::auth::AuthContext;
use crate::models::{LoginRequest, LoginResponse, RegisterRequest, UserResponse};
use crate::utils::{ApiError, ApiResult};

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Account created", body = LoginResponse),
        (status = 409, description = "Email already registered"),
    ),
    tag = "Auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<LoginResponse>> {
    req.validate().map_err(|err| ApiError::validation_error(err.to_string()))?;
    let response = state.user_service.register(req).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Invalid credentials"),
    ),
    tag = "Auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let response = state.user_service.login(req).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Auth"
)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<UserResponse>> {
    let user = state.user_service.me(ctx.user_id).await?;
    Ok(Json(user))
}
