//! Directory of registered tenants, stored in `public.tenants`.
//!
//! The directory gives each tenant a stable integer id, which is what access
//! and refresh tokens carry as `tenant_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, PgPool};
use std::fmt;

use super::is_concurrent_ddl_conflict;
use super::namespace::TenantName;
use crate::error::{Result, StratumError};

/// Stable numeric tenant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct TenantId(pub i32);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row of `public.tenants`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

const TENANTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS public.tenants (
    id         SERIAL PRIMARY KEY,
    name       VARCHAR(63) NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Resolves a tenant name to its registered id.
#[async_trait]
pub trait TenantLookup: Send + Sync {
    /// `None` when the tenant has not been registered.
    async fn tenant_id(&self, tenant: &TenantName) -> Result<Option<TenantId>>;
}

/// Access to `public.tenants`.
#[derive(Clone, Debug)]
pub struct TenantDirectory {
    pool: PgPool,
}

impl TenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the directory table if it does not exist.
    pub async fn ensure_table(&self) -> Result<()> {
        match self.pool.execute(TENANTS_DDL).await {
            Ok(_) => Ok(()),
            // Another process created it between our existence check and insert.
            Err(e) if is_concurrent_ddl_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a tenant, returning the existing row if already present.
    pub async fn register(&self, tenant: &TenantName) -> Result<TenantRecord> {
        let record = sqlx::query_as::<_, TenantRecord>(
            r#"
            INSERT INTO public.tenants (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, created_at
            "#,
        )
        .bind(tenant.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_name(&self, tenant: &TenantName) -> Result<Option<TenantRecord>> {
        let record = sqlx::query_as::<_, TenantRecord>(
            "SELECT id, name, created_at FROM public.tenants WHERE name = $1",
        )
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Look up a tenant by id, `NotFound` if unknown.
    pub async fn get(&self, id: TenantId) -> Result<TenantRecord> {
        sqlx::query_as::<_, TenantRecord>(
            "SELECT id, name, created_at FROM public.tenants WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StratumError::not_found("tenant", id))
    }

    /// All registered tenants, ordered by name.
    pub async fn list(&self) -> Result<Vec<TenantRecord>> {
        let records = sqlx::query_as::<_, TenantRecord>(
            "SELECT id, name, created_at FROM public.tenants ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[async_trait]
impl TenantLookup for TenantDirectory {
    async fn tenant_id(&self, tenant: &TenantName) -> Result<Option<TenantId>> {
        Ok(self.find_by_name(tenant).await?.map(|record| record.id))
    }
}
