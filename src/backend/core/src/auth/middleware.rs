//! Bearer-token authentication middleware.
//!
//! Runs after tenant resolution. The access token is read from the
//! `Authorization: Bearer` header (or the `AccessToken` cookie), validated,
//! and checked against the resolved tenant: a token minted for another
//! tenant is rejected with 403 even though its signature is valid.
//!
//! # Example
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/api/groups", get(list_groups))
//!     .layer(AuthLayer::new(tokens, Arc::new(tenant_directory)))
//!     .layer(TenantLayer::new("example.com"));
//! ```

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
        HeaderMap,
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::claims::IdentityClaims;
use super::token::TokenService;
use crate::db::{TenantId, TenantLookup, TenantName};
use crate::error::{Result, StratumError};
use crate::rbac::UserId;
use crate::telemetry::AuthMetrics;
use crate::tenancy::CurrentTenant;

/// Cookie consulted when no `Authorization` header is present.
pub const ACCESS_TOKEN_COOKIE: &str = "AccessToken";

// ═══════════════════════════════════════════════════════════════════════════════
// Authentication Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub tenant: TenantName,
    pub expires_at: DateTime<Utc>,
}

impl AuthContext {
    fn from_claims(claims: &IdentityClaims, tenant: TenantName) -> Self {
        Self {
            user_id: claims.user_id,
            tenant_id: claims.tenant_id,
            tenant,
            expires_at: claims.expires_at(),
        }
    }
}

/// Extract the raw access token from the request headers.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        return value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == ACCESS_TOKEN_COOKIE)
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authenticator
// ═══════════════════════════════════════════════════════════════════════════════

/// Validates access tokens against the tenant directory.
#[derive(Clone)]
pub struct Authenticator {
    tokens: Arc<TokenService>,
    tenants: Arc<dyn TenantLookup>,
}

impl Authenticator {
    pub fn new(tokens: Arc<TokenService>, tenants: Arc<dyn TenantLookup>) -> Self {
        Self { tokens, tenants }
    }

    /// Authenticate a request already routed to `tenant`.
    pub async fn authenticate(&self, headers: &HeaderMap, tenant: &TenantName) -> Result<AuthContext> {
        let token = extract_token(headers).ok_or_else(|| {
            AuthMetrics::failure("missing_credentials");
            StratumError::unauthorized("Authentication credentials are required")
        })?;

        let claims = self.tokens.validate_access(token)?;

        let registered = self.tenants.tenant_id(tenant).await?;
        if registered != Some(claims.tenant_id) {
            warn!(
                tenant = %tenant,
                token_tenant_id = claims.tenant_id.0,
                user_id = claims.user_id.0,
                "Token presented to a different tenant"
            );
            AuthMetrics::failure("tenant_mismatch");
            return Err(StratumError::forbidden("Token does not belong to this tenant"));
        }

        debug!(tenant = %tenant, user_id = claims.user_id.0, "Request authenticated");
        Ok(AuthContext::from_claims(&claims, tenant.clone()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication layer for Tower.
#[derive(Clone)]
pub struct AuthLayer {
    authenticator: Authenticator,
}

impl AuthLayer {
    pub fn new(tokens: Arc<TokenService>, tenants: Arc<dyn TenantLookup>) -> Self {
        Self {
            authenticator: Authenticator::new(tokens, tenants),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            authenticator: self.authenticator.clone(),
        }
    }
}

/// Authentication service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    authenticator: Authenticator,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let authenticator = self.authenticator.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(CurrentTenant(tenant)) = request.extensions().get::<CurrentTenant>().cloned() else {
                return Ok(StratumError::internal("auth layer installed without tenant layer").into_response());
            };

            match authenticator.authenticate(request.headers(), &tenant).await {
                Ok(context) => {
                    request.extensions_mut().insert(context);
                    inner.call(request).await
                }
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Extractor
// ═══════════════════════════════════════════════════════════════════════════════

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = StratumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| StratumError::unauthorized("Authentication credentials are required"))
    }
}
