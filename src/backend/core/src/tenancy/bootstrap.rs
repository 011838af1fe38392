//! Tenant setup: schema, tables, system permissions and the admin group.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db::schema::{GROUPS_PERMISSIONS, USERS};
use crate::db::{TenantDirectory, TenantId, TenantName, TenantRouter};
use crate::error::Result;
use crate::rbac::{Group, PermissionStore, ADMIN_GROUP, SYSTEM_PERMISSIONS};

/// Schema creators every tenant gets, in application order.
pub const TENANT_SCHEMA_CREATORS: [&str; 2] = [USERS, GROUPS_PERMISSIONS];

/// Outcome of setting up one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSetup {
    pub tenant: TenantName,
    pub tenant_id: TenantId,
    pub admin_group: Group,
}

/// A tenant that failed during startup initialization.
#[derive(Debug, Clone, Serialize)]
pub struct TenantFailure {
    pub tenant: TenantName,
    pub error: String,
}

/// Result of re-initializing every existing namespace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub succeeded: Vec<TenantName>,
    pub failed: Vec<TenantFailure>,
}

impl InitReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Brings tenants to their required baseline. Every step is idempotent, so
/// setup can be re-run on an existing tenant without side effects.
#[derive(Clone, Debug)]
pub struct TenantBootstrapper {
    router: TenantRouter,
    tenants: TenantDirectory,
    store: Arc<PermissionStore>,
}

impl TenantBootstrapper {
    pub fn new(router: TenantRouter, tenants: TenantDirectory, store: Arc<PermissionStore>) -> Self {
        Self {
            router,
            tenants,
            store,
        }
    }

    /// Provision `tenant`, create its tables, seed the system permissions,
    /// ensure the admin group holds all of them and register the tenant id.
    #[instrument(skip_all, fields(tenant = %tenant))]
    pub async fn setup(&self, tenant: &TenantName) -> Result<TenantSetup> {
        let mut conn = self.router.provision(tenant).await?;
        self.router
            .apply_schema_creators(&mut conn, &TENANT_SCHEMA_CREATORS)
            .await?;

        self.store.ensure_permissions(&mut conn, &SYSTEM_PERMISSIONS).await?;
        let admin = self.store.ensure_group(&mut conn, ADMIN_GROUP).await?;
        self.store.enforce_all(&mut conn).await?;
        let admin_group = self.store.get_group(&mut conn, admin.id).await?;
        drop(conn);

        let record = self.tenants.register(tenant).await?;
        info!(
            tenant_id = record.id.0,
            admin_permissions = admin_group.permission_ids.len(),
            "Tenant set up"
        );

        Ok(TenantSetup {
            tenant: tenant.clone(),
            tenant_id: record.id,
            admin_group,
        })
    }

    /// Run [`setup`](Self::setup) over every existing namespace. A failing
    /// tenant is logged and reported; the others still run.
    pub async fn initialize_all(&self) -> Result<InitReport> {
        self.tenants.ensure_table().await?;
        let namespaces = self.router.list_namespaces().await?;

        let mut report = InitReport::default();
        for tenant in namespaces {
            match self.setup(&tenant).await {
                Ok(_) => report.succeeded.push(tenant),
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Tenant initialization failed, skipping"
                    );
                    report.failed.push(TenantFailure {
                        tenant,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Tenant initialization finished"
        );
        Ok(report)
    }
}
