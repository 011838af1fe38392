//! Database layer for Stratum.
//!
//! One shared PostgreSQL pool (sqlx) serves every tenant. Tenant isolation is
//! a connection-local `search_path`, set by [`router::TenantRouter`] and
//! reset by the pool whenever a connection is released.

pub mod namespace;
pub mod registry;
pub mod router;
pub mod schema;
pub mod tenants;

pub use namespace::{TenantName, PUBLIC_TENANT};
pub use registry::{SchemaCreator, SchemaRegistry, SchemaRegistryBuilder};
pub use router::{TenantConnection, TenantRouter};
pub use schema::{default_registry, GroupsPermissionsSchema, UsersSchema};
pub use tenants::{TenantDirectory, TenantId, TenantLookup, TenantRecord};

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{Result, StratumError};

/// Database connection pool.
#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create the connection pool.
    ///
    /// Released connections get `RESET search_path`; a connection that fails
    /// the reset is closed instead of being handed to the next tenant.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name);

        let pool = pool_options(config)
            .connect_with(options)
            .await
            .map_err(|e| {
                StratumError::from(e)
                    .with_context("host", &config.host)
                    .with_context("database", &config.name)
            })?;

        info!(
            host = %config.host,
            database = %config.name,
            max_connections = config.max_connections,
            "Database pool ready"
        );

        Ok(Self { pool })
    }

    /// Create the pool from a `postgres://` URL, taking pool sizing from
    /// `config`.
    pub async fn connect_url(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e| StratumError::configuration("invalid database url").with_source(e))?;
        let pool = pool_options(config).connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    ///
    /// The caller is responsible for resetting `search_path` on release.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .after_release(|conn, _meta| {
            Box::pin(async move { Ok(conn.execute("RESET search_path").await.is_ok()) })
        })
}

/// SQLSTATEs raised when two sessions run the same idempotent DDL at once.
const CONCURRENT_DDL_STATES: &[&str] = &[
    "23505", // unique_violation on a catalog index
    "42P06", // duplicate_schema
    "42P07", // duplicate_table
    "42710", // duplicate_object
    "42723", // duplicate_function
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// Whether `err` is a lost race between concurrent idempotent DDL statements,
/// which succeeds when retried.
pub(crate) fn is_concurrent_ddl_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some(code) if CONCURRENT_DDL_STATES.contains(&code) => true,
            Some("XX000") => db_err.message().contains("tuple concurrently updated"),
            _ => false,
        },
        _ => false,
    }
}
