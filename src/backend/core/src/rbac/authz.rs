//! Authorization queries composed from the tenant router and the store.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::{PermissionRef, UserId};
use super::store::PermissionStore;
use crate::db::{TenantName, TenantRouter};
use crate::error::{Result, StratumError};
use crate::telemetry::PermissionCheckMetrics;

/// Checks a user's permissions inside a tenant.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// `Ok(())` iff the user holds every permission in `names`; `Forbidden`
    /// otherwise.
    async fn require_all(&self, tenant: &TenantName, user: UserId, names: &[String]) -> Result<()>;
}

/// Answers "does user X have permission Y in tenant T".
///
/// Each call acquires a tenant-scoped connection and releases it before
/// returning. Nothing is cached.
#[derive(Clone, Debug)]
pub struct AuthorizationService {
    router: TenantRouter,
    store: Arc<PermissionStore>,
}

impl AuthorizationService {
    pub fn new(router: TenantRouter, store: Arc<PermissionStore>) -> Self {
        Self { router, store }
    }

    pub async fn user_has_permission(
        &self,
        tenant: &TenantName,
        user: UserId,
        permission: impl Into<PermissionRef>,
    ) -> Result<bool> {
        let permission = permission.into();
        let mut conn = self.router.connection_for(tenant).await?;
        let allowed = self
            .store
            .user_has_permission(&mut conn, user, permission.clone())
            .await?;

        PermissionCheckMetrics::record(allowed);
        debug!(tenant = %tenant, user_id = user.0, permission = %permission, allowed, "Permission checked");
        Ok(allowed)
    }
}

#[async_trait]
impl PermissionChecker for AuthorizationService {
    async fn require_all(&self, tenant: &TenantName, user: UserId, names: &[String]) -> Result<()> {
        let mut conn = self.router.connection_for(tenant).await?;

        for name in names {
            let allowed = self
                .store
                .user_has_permission(&mut conn, user, name.as_str())
                .await?;
            PermissionCheckMetrics::record(allowed);

            if !allowed {
                warn!(tenant = %tenant, user_id = user.0, permission = %name, "Permission denied");
                return Err(StratumError::forbidden(format!(
                    "You do not have permission: {}",
                    name
                ))
                .with_context("permission", name));
            }
        }
        Ok(())
    }
}
