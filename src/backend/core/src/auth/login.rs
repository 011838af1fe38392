//! Username/password login against a tenant's user table.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::password::{verify_dummy_password, verify_password};
use super::token::{TokenPair, TokenService};
use crate::db::{TenantLookup, TenantName, TenantRouter};
use crate::error::{Result, StratumError};
use crate::rbac::UserDirectory;
use crate::telemetry::AuthMetrics;

const BAD_CREDENTIALS: &str = "Invalid username or password";

/// Exchanges credentials for a token pair.
#[derive(Clone)]
pub struct LoginService {
    router: TenantRouter,
    tenants: Arc<dyn TenantLookup>,
    tokens: Arc<TokenService>,
    users: UserDirectory,
}

impl LoginService {
    pub fn new(router: TenantRouter, tenants: Arc<dyn TenantLookup>, tokens: Arc<TokenService>) -> Self {
        Self {
            router,
            tenants,
            tokens,
            users: UserDirectory::new(),
        }
    }

    /// Verify `username`/`password` inside `tenant` and issue tokens.
    ///
    /// Unknown users and wrong passwords both fail with `Unauthorized`.
    /// Inactive and suspended accounts fail with `Forbidden`.
    #[instrument(skip(self, password), fields(tenant = %tenant))]
    pub async fn login(&self, tenant: &TenantName, username: &str, password: &str) -> Result<TokenPair> {
        let tenant_id = self
            .tenants
            .tenant_id(tenant)
            .await?
            .ok_or_else(|| StratumError::not_found("tenant", tenant))?;

        let user = {
            let mut conn = self.router.connection_for(tenant).await?;
            self.users.find_by_username(&mut conn, username).await?
        };

        let Some(user) = user else {
            verify_dummy_password(password);
            AuthMetrics::failure("bad_credentials");
            return Err(StratumError::unauthorized(BAD_CREDENTIALS));
        };

        if !verify_password(password, &user.password_hash)? {
            AuthMetrics::failure("bad_credentials");
            return Err(StratumError::unauthorized(BAD_CREDENTIALS));
        }

        if !user.status.can_login() {
            warn!(user_id = user.id.0, status = %user.status, "Login refused for non-active user");
            AuthMetrics::failure("inactive_user");
            return Err(StratumError::forbidden("Account is not active"));
        }

        let pair = self.tokens.issue_tokens(user.id, tenant_id)?;
        info!(user_id = user.id.0, tenant_id = tenant_id.0, "User logged in");
        Ok(pair)
    }
}
