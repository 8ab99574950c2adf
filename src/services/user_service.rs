//! Registration, login, and session issuance (C1). Runs against the `admin`
//! pool directly: auth predates RLS scoping -- there is no acting user yet.

use std::sync::Arc;

use bcrypt::{DEFAULT_COST, hash, verify};
use sqlx::PgPool;

use crate::models::{LoginRequest, LoginResponse, RegisterRequest, User, UserResponse};
use crate::utils::{ApiError, ApiResult, JwtUtil};

#[derive(Clone)]
pub struct UserService {
    pool: PgPool,
    jwt_util: Arc<JwtUtil>,
}

impl UserService {
    pub fn new(pool: PgPool, jwt_util: Arc<JwtUtil>) -> Self {
        Self { pool, jwt_util }
    }

    pub async fn register(&self, req: RegisterRequest) -> ApiResult<LoginResponse> {
        let existing: Option<(uuid::Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE primary_email = $1")
                .bind(&req.primary_email)
                .fetch_optional(&self.pool)
                .await?;

        if existing.is_some() {
            return Err(ApiError::conflict("an account with this email already exists"));
        }

        let password_hash = hash(&req.password, DEFAULT_COST)
            .map_err(|err| ApiError::internal_error(format!("failed to hash password: {err}")))?;

        let user: User = sqlx::query_as(
            r#"
            INSERT INTO users (display_name, primary_email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&req.display_name)
        .bind(&req.primary_email)
        .bind(&password_hash)
        .fetch_one(&self.pool)
        .await?;

        self.issue_login(user)
    }

    pub async fn login(&self, req: LoginRequest) -> ApiResult<LoginResponse> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE primary_email = $1")
            .bind(&req.primary_email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::unauthorized("invalid email or password"))?;

        let matches = verify(&req.password, &user.password_hash)
            .map_err(|err| ApiError::internal_error(format!("failed to verify password: {err}")))?;

        if !matches {
            return Err(ApiError::unauthorized("invalid email or password"));
        }

        self.issue_login(user)
    }

    pub async fn me(&self, user_id: uuid::Uuid) -> ApiResult<UserResponse> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::not_found("user not found"))?;

        Ok(user.into())
    }

    fn issue_login(&self, user: User) -> ApiResult<LoginResponse> {
        let token = self.jwt_util.generate_token(user.id, &user.display_name, user.is_admin)?;
        Ok(LoginResponse { token, user: user.into() })
    }
}
