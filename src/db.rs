//! Row-level-security-aware connection handling (C1/C2).
//!
//! Two pools are maintained: `app` (no BYPASSRLS — every statement runs under
//! `app.current_user_id`) and `admin` (BYPASSRLS — catalog maintenance, the
//! session sweep, and admin endpoints). A single user-mode logical operation
//! must hold one connection for its whole lifetime because `SET LOCAL` is
//! session-local; `with_user_transaction` enforces that by handing the caller
//! a single open transaction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use uuid::Uuid;

use crate::utils::{ApiError, ApiResult};

#[derive(Clone)]
pub struct Db {
    /// `app` role pool — every connection is RLS-scoped per transaction.
    pub app: PgPool,
    /// `admin` role pool — BYPASSRLS, used only by the job fabric sweep and
    /// catalog-maintenance endpoints (analyte approval, etc).
    pub admin: PgPool,
}

impl Db {
    pub async fn connect(app_url: &str, admin_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let app = PgPoolOptions::new().max_connections(max_connections).connect(app_url).await?;
        let admin =
            PgPoolOptions::new().max_connections(max_connections.max(2)).connect(admin_url).await?;
        Ok(Self { app, admin })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.admin).await?;
        Ok(())
    }

    /// Open a single transaction on the `app` pool, bind
    /// `app.current_user_id` for its lifetime via `SET LOCAL`, and hand it to
    /// `f`. Commits on `Ok`, rolls back on `Err`.
    pub async fn with_user_transaction<F, T>(&self, user_id: Uuid, f: F) -> ApiResult<T>
    where
        F: AsyncFnOnce(&mut Transaction<'static, Postgres>) -> ApiResult<T>,
    {
        let mut tx: Transaction<'static, Postgres> = self.app.begin().await?;
        sqlx::query("SELECT set_config('app.current_user_id', $1, true)")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        let result = f(&mut tx).await;

        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            },
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            },
        }
    }

    /// Acquire a session-scoped Postgres advisory lock keyed by the 32-bit
    /// hash of `key`, run `f`, and release the lock on every exit path.
    pub async fn with_advisory_lock<'c, F, T>(
        &self,
        conn: &mut Transaction<'c, Postgres>,
        key: &str,
        f: F,
    ) -> ApiResult<T>
    where
        F: AsyncFnOnce(&mut Transaction<'c, Postgres>) -> ApiResult<T>,
    {
        let lock_key = hash32(key);
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key as i64)
            .execute(&mut **conn)
            .await?;
        // pg_advisory_xact_lock is released automatically at transaction end
        // (commit or rollback) -- this is the try/finally discipline the
        // catalog contract (C2) requires, expressed without an explicit
        // unlock call.
        f(conn).await
    }
}

/// 32-bit hash used for advisory-lock keys (C2 contract, C5 auto-learn).
pub fn hash32(key: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as u32
}

pub async fn fetch_user_id_uuid(claims_sub: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(claims_sub).map_err(|_| ApiError::unauthorized("malformed subject claim"))
}
