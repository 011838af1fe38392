//! HTTP API for Stratum.
//!
//! # Routes
//!
//! - `GET /health`, `GET /api/health/db`, `GET /metrics`: no tenant, no auth
//! - `POST /api/tenant/setup`, `POST /api/auth/{login,register,refresh}`,
//!   `GET /api/auth/verify`: tenant resolved from the host, no auth
//! - `POST /api/auth/{logout,change-password}`: tenant, then access token
//! - everything else under `/api`: tenant, then Bearer access token, then a
//!   per-route permission guard
//!
//! Handlers return `Result<impl IntoResponse, StratumError>`; errors render
//! through `StratumError`'s `IntoResponse`.

mod handlers;

use axum::{
    handler::Handler,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::auth::{AuthLayer, LoginService, TokenService};
use crate::db::{Database, SchemaRegistry, TenantDirectory, TenantLookup, TenantRouter};
use crate::rbac::{
    AuthorizationService, PermissionChecker, PermissionStore, RequirePermissionLayer, UserDirectory,
};
use crate::telemetry::MetricsRegistry;
use crate::tenancy::{TenantBootstrapper, TenantLayer};

pub use handlers::{
    ChangePasswordRequest, GroupQuery, LoginRequest, LogoutRequest, NameRequest, RefreshRequest,
    SetPermissionsRequest, TokenVerification,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub router: TenantRouter,
    pub users: UserDirectory,
    pub store: Arc<PermissionStore>,
    pub tokens: Arc<TokenService>,
    pub login: LoginService,
    pub bootstrapper: TenantBootstrapper,
    pub checker: Arc<dyn PermissionChecker>,
    pub tenants: Arc<dyn TenantLookup>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    /// Wire every service over one pool.
    pub fn new(
        pool: PgPool,
        registry: Arc<SchemaRegistry>,
        store: Arc<PermissionStore>,
        tokens: Arc<TokenService>,
        metrics: MetricsRegistry,
    ) -> Self {
        let router = TenantRouter::new(pool.clone(), registry);
        let directory = TenantDirectory::new(pool.clone());
        let tenants: Arc<dyn TenantLookup> = Arc::new(directory.clone());

        Self {
            database: Database::from_pool(pool),
            users: UserDirectory::new(),
            login: LoginService::new(router.clone(), tenants.clone(), tokens.clone()),
            bootstrapper: TenantBootstrapper::new(router.clone(), directory, store.clone()),
            checker: Arc::new(AuthorizationService::new(router.clone(), store.clone())),
            router,
            store,
            tokens,
            tenants,
            metrics,
        }
    }

    /// Replace the permission checker used by the route guards.
    pub fn with_permission_checker(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.checker = checker;
        self
    }

    /// Replace the tenant lookup used by authentication.
    pub fn with_tenant_lookup(mut self, tenants: Arc<dyn TenantLookup>) -> Self {
        self.tenants = tenants;
        self
    }
}

/// Build the API router.
///
/// `base_domain` is the host tenants are subdomains of; `request_timeout`
/// bounds every request.
pub fn build_router(state: AppState, base_domain: &str, request_timeout: Duration) -> Router {
    let checker = state.checker.clone();
    let guard = move |permission: &str| RequirePermissionLayer::new(checker.clone(), [permission]);

    let unauthenticated = Router::new()
        .route("/api/tenant/setup", post(handlers::setup_tenant))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/auth/register", post(handlers::register))
        .route("/api/auth/refresh", post(handlers::refresh))
        .route("/api/auth/verify", get(handlers::verify_token));

    let authenticated = Router::new()
        .route("/api/auth/logout", post(handlers::logout))
        .route("/api/auth/change-password", post(handlers::change_password))
        .route(
            "/api/permissions",
            get(handlers::list_permissions.layer(guard("permission_view")))
                .post(handlers::create_permission.layer(guard("permission_create"))),
        )
        .route(
            "/api/permissions/:id",
            delete(handlers::delete_permission.layer(guard("permission_delete"))),
        )
        .route(
            "/api/groups",
            get(handlers::list_groups.layer(guard("group_view")))
                .post(handlers::create_group.layer(guard("group_create"))),
        )
        .route(
            "/api/groups/:id",
            delete(handlers::delete_group.layer(guard("group_delete"))),
        )
        .route(
            "/api/groups/:id/permissions",
            put(handlers::set_group_permissions.layer(guard("group_update"))),
        )
        .route(
            "/api/groups/:id/permissions/:pid",
            post(handlers::add_group_permission.layer(guard("group_update")))
                .delete(handlers::remove_group_permission.layer(guard("group_update"))),
        )
        .route_layer(AuthLayer::new(state.tokens.clone(), state.tenants.clone()));

    let api = unauthenticated
        .merge(authenticated)
        .layer(TenantLayer::new(base_domain));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health/db", get(handlers::database_health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .merge(api)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Response envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// Success envelope; errors use [`crate::error::ErrorResponse`].
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, "test data");

        let json = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"][1], 2);
    }
}
