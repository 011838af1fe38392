//! Schema-per-tenant connection routing.
//!
//! The router hands out pooled connections whose `search_path` points at one
//! tenant's schema, and provisions schemas on first use. Provisioning relies
//! on idempotent DDL plus a bounded, jittered retry when concurrent sessions
//! race on the catalog; there is no tenant-level lock.

use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::namespace::TenantName;
use super::registry::{SchemaCreator, SchemaRegistry};
use super::schema::{touch_updated_at_ddl, TOUCH_UPDATED_AT_FN};
use super::is_concurrent_ddl_conflict;
use crate::error::{Result, StratumError};
use crate::telemetry::ProvisionMetrics;

/// Attempts made for DDL that lost a race with a concurrent session.
const MAX_DDL_ATTEMPTS: u32 = 8;

/// Base delay between DDL attempts; grows linearly with the attempt number.
const DDL_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Fraction of the delay added or removed at random so contenders spread out.
const DDL_RETRY_JITTER: f64 = 0.5;

/// A pooled connection scoped to one tenant's schema.
///
/// Dropping the guard returns the connection to the pool on every path,
/// including when the owning future is cancelled. The pool resets
/// `search_path` on release.
pub struct TenantConnection {
    tenant: TenantName,
    conn: PoolConnection<Postgres>,
}

impl TenantConnection {
    /// The tenant this connection is scoped to.
    pub fn tenant(&self) -> &TenantName {
        &self.tenant
    }
}

impl Deref for TenantConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl DerefMut for TenantConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

impl fmt::Debug for TenantConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConnection")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

/// Maps tenants to schema-scoped connections.
#[derive(Clone)]
pub struct TenantRouter {
    pool: PgPool,
    registry: Arc<SchemaRegistry>,
}

impl fmt::Debug for TenantRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl TenantRouter {
    pub fn new(pool: PgPool, registry: Arc<SchemaRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Acquire a connection scoped to an existing tenant schema.
    ///
    /// # Errors
    ///
    /// `ConnectionFailure` when the pool cannot supply a connection,
    /// `SchemaMissing` when the tenant has not been provisioned.
    #[instrument(skip_all, fields(tenant = %tenant))]
    pub async fn connection_for(&self, tenant: &TenantName) -> Result<TenantConnection> {
        let mut conn = self.pool.acquire().await?;

        if !schema_exists(&mut conn, tenant).await? {
            return Err(StratumError::schema_missing(tenant.as_str()));
        }

        set_search_path(&mut conn, tenant).await?;
        Ok(TenantConnection {
            tenant: tenant.clone(),
            conn,
        })
    }

    /// Create the tenant schema and its helper routine if absent, then return
    /// a connection scoped to it. Safe to call repeatedly and concurrently.
    ///
    /// Both statements run in one transaction, so the schema never exists
    /// without its helper routine.
    ///
    /// # Errors
    ///
    /// `ConnectionFailure` when the pool cannot supply a connection,
    /// `ProvisionFailure` when the DDL fails (the transaction is rolled back).
    #[instrument(skip_all, fields(tenant = %tenant))]
    pub async fn provision(&self, tenant: &TenantName) -> Result<TenantConnection> {
        let mut conn = self.pool.acquire().await?;

        let mut attempt = 1;
        loop {
            match provision_schema(&mut conn, tenant).await {
                Ok(()) => break,
                Err(e) if is_concurrent_ddl_conflict(&e) && attempt < MAX_DDL_ATTEMPTS => {
                    debug!(attempt, error = %e, "Concurrent schema provisioning, retrying");
                    tokio::time::sleep(ddl_retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    ProvisionMetrics::record(false);
                    return Err(StratumError::provision_failed(tenant.as_str(), e.to_string())
                        .with_source(e));
                }
            }
        }

        set_search_path(&mut conn, tenant).await?;
        ProvisionMetrics::record(true);
        info!("Tenant schema provisioned");

        Ok(TenantConnection {
            tenant: tenant.clone(),
            conn,
        })
    }

    /// Every schema that can be a tenant, ordered by name.
    ///
    /// System schemas (`information_schema`, `pg_*`) are excluded, as are
    /// schemas whose names are not valid tenant identifiers.
    pub async fn list_namespaces(&self) -> Result<Vec<TenantName>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT nspname::TEXT
            FROM pg_namespace
            WHERE nspname <> 'information_schema'
              AND nspname NOT LIKE 'pg\_%'
            ORDER BY nspname
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names
            .into_iter()
            .filter_map(|name| match TenantName::parse(&name) {
                Ok(tenant) => Some(tenant),
                Err(_) => {
                    debug!(schema = %name, "Skipping schema that is not a tenant identifier");
                    None
                }
            })
            .collect())
    }

    /// Run the named schema creators against `conn`, in order, each in its
    /// own transaction.
    ///
    /// All names are resolved before any DDL runs, so an unknown name is a
    /// `NotFound` with no side effects.
    #[instrument(skip_all, fields(tenant = %conn.tenant(), creators = ?names))]
    pub async fn apply_schema_creators(
        &self,
        conn: &mut TenantConnection,
        names: &[&str],
    ) -> Result<()> {
        let creators = names
            .iter()
            .map(|name| Ok((*name, self.registry.get(name)?)))
            .collect::<Result<Vec<_>>>()?;

        for (name, creator) in creators {
            run_creator(conn, name, creator.as_ref()).await.map_err(|e| {
                StratumError::provision_failed(conn.tenant().as_str(), e.to_string())
                    .with_context("schema_creator", name)
                    .with_source(e)
            })?;
            debug!(schema_creator = name, "Schema creator applied");
        }
        Ok(())
    }
}

async fn schema_exists(conn: &mut PgConnection, tenant: &TenantName) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
        .bind(tenant.as_str())
        .fetch_one(conn)
        .await?;
    Ok(exists)
}

async fn set_search_path(conn: &mut PgConnection, tenant: &TenantName) -> Result<()> {
    conn.execute(format!("SET search_path TO {}", tenant.quoted()).as_str())
        .await?;
    Ok(())
}

async fn provision_schema(conn: &mut PgConnection, tenant: &TenantName) -> sqlx::Result<()> {
    let schema = tenant.quoted();
    let mut tx = conn.begin().await?;
    (&mut *tx)
        .execute(format!("CREATE SCHEMA IF NOT EXISTS {}", schema).as_str())
        .await?;

    let missing: bool = sqlx::query_scalar(
        r#"
        SELECT NOT EXISTS (
            SELECT 1
            FROM pg_proc p
            JOIN pg_namespace n ON n.oid = p.pronamespace
            WHERE n.nspname = $1 AND p.proname = $2 AND p.pronargs = 0
        )
        "#,
    )
    .bind(tenant.as_str())
    .bind(TOUCH_UPDATED_AT_FN)
    .fetch_one(&mut *tx)
    .await?;
    if missing {
        (&mut *tx).execute(touch_updated_at_ddl(&schema).as_str()).await?;
    }
    tx.commit().await
}

/// Linear backoff with random jitter of +/- `DDL_RETRY_JITTER`.
fn ddl_retry_delay(attempt: u32) -> Duration {
    let base = DDL_RETRY_DELAY * attempt;
    let factor = 1.0 + (rand_unit() * 2.0 - 1.0) * DDL_RETRY_JITTER;
    base.mul_f64(factor)
}

/// A value in `[0, 1]` from the std hasher's random keys.
fn rand_unit() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

async fn run_creator(
    conn: &mut TenantConnection,
    name: &str,
    creator: &dyn SchemaCreator,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        let mut tx = conn.begin().await?;
        let outcome = match creator.create(&mut tx).await {
            Ok(()) => tx.commit().await.map_err(StratumError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_DDL_ATTEMPTS && lost_ddl_race(&e) => {
                warn!(schema_creator = name, attempt, "Concurrent table provisioning, retrying");
                tokio::time::sleep(ddl_retry_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn lost_ddl_race(err: &StratumError) -> bool {
    err.source_as::<sqlx::Error>()
        .is_some_and(is_concurrent_ddl_conflict)
}
