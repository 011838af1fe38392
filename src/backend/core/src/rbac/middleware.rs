//! Axum middleware that enforces group permissions on requests.
//!
//! Reads the [`AuthContext`] injected by the auth middleware and asks a
//! [`PermissionChecker`] whether the user holds every listed permission in
//! the request's tenant.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::authz::PermissionChecker;
use super::models::UserId;
use crate::auth::AuthContext;
use crate::error::StratumError;

// ═══════════════════════════════════════════════════════════════════════════════
// RBAC Context (extracted in handlers)
// ═══════════════════════════════════════════════════════════════════════════════

/// Inserted by [`RequirePermissionService`] once the check passed.
#[derive(Debug, Clone)]
pub struct RbacContext {
    pub user_id: UserId,
    /// Permissions that were verified for this request.
    pub checked_permissions: Vec<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RbacContext
where
    S: Send + Sync,
{
    type Rejection = StratumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RbacContext>()
            .cloned()
            .ok_or_else(|| StratumError::internal("permission layer is not installed"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that requires every listed permission.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/api/groups", post(create_group))
///     .route_layer(RequirePermissionLayer::new(checker.clone(), ["group_create"]));
/// ```
#[derive(Clone)]
pub struct RequirePermissionLayer {
    checker: Arc<dyn PermissionChecker>,
    permissions: Arc<[String]>,
}

impl RequirePermissionLayer {
    pub fn new<I, S>(checker: Arc<dyn PermissionChecker>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            checker,
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }
}

impl<S> Layer<S> for RequirePermissionLayer {
    type Service = RequirePermissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequirePermissionService {
            inner,
            checker: self.checker.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Service
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct RequirePermissionService<S> {
    inner: S,
    checker: Arc<dyn PermissionChecker>,
    permissions: Arc<[String]>,
}

impl<S> Service<Request<Body>> for RequirePermissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let checker = self.checker.clone();
        let permissions = self.permissions.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(auth) = request.extensions().get::<AuthContext>().cloned() else {
                return Ok(
                    StratumError::unauthorized("Authentication required for this resource")
                        .into_response(),
                );
            };

            if let Err(e) = checker
                .require_all(&auth.tenant, auth.user_id, &permissions)
                .await
            {
                return Ok(e.into_response());
            }

            request.extensions_mut().insert(RbacContext {
                user_id: auth.user_id,
                checked_permissions: permissions.to_vec(),
            });
            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
