//! API request handlers.
//!
//! All handlers return `Result<impl IntoResponse, StratumError>` so that
//! errors are converted to HTTP status codes by `StratumError`'s
//! `IntoResponse` implementation.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::{ApiResponse, AppState};
use crate::auth::{extract_token, AuthContext};
use crate::db::TenantId;
use crate::error::StratumError;
use crate::rbac::models::DEFAULT_PAGE_SIZE;
use crate::rbac::{GroupId, NewUser, Page, PermissionId, UserId};
use crate::tenancy::CurrentTenant;

/// Upper bound on the database health probe.
const DB_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn database_health(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = match tokio::time::timeout(DB_HEALTH_TIMEOUT, state.database.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.user_message().to_string()),
        Err(_) => Err("Database ping timed out".to_string()),
    };

    match outcome {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy", "database": "connected" })),
        ),
        Err(error) => {
            warn!(%error, "Database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unhealthy", "error": error })),
            )
        }
    }
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tenant & Auth
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn setup_tenant(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
) -> Result<impl IntoResponse, StratumError> {
    let setup = state.bootstrapper.setup(&tenant).await?;
    Ok(Json(ApiResponse::success(setup)))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StratumError> {
    let pair = state.login.login(&tenant, &req.username, &req.password).await?;
    Ok(Json(ApiResponse::success(pair)))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, StratumError> {
    let token = state.tokens.refresh(&req.refresh_token)?;
    Ok(Json(ApiResponse::success(token)))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

/// Tokens are stateless; logout only checks that a presented refresh token
/// belongs to the caller so the client can discard both.
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
    body: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, StratumError> {
    let refresh_token = body
        .and_then(|Json(req)| req.refresh_token)
        .filter(|t| !t.is_empty());
    if let Some(token) = refresh_token {
        state
            .tokens
            .verify_logout(&token, auth.user_id, auth.tenant_id)?;
    }

    info!(user_id = auth.user_id.0, tenant = %auth.tenant, "User logged out");
    Ok(Json(ApiResponse::success(serde_json::json!({
        "message": "Logged out successfully"
    }))))
}

/// Decoded access-token claims returned by `GET /api/auth/verify`.
#[derive(Debug, Serialize)]
pub struct TokenVerification {
    pub valid: bool,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn verify_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StratumError> {
    let token = extract_token(&headers).ok_or_else(|| {
        StratumError::invalid_argument("Authorization header must be in format: Bearer <token>")
    })?;
    let claims = state.tokens.validate_access(token)?;

    Ok(Json(ApiResponse::success(TokenVerification {
        valid: true,
        user_id: claims.user_id,
        tenant_id: claims.tenant_id,
        issued_at: claims.issued_at(),
        expires_at: claims.expires_at(),
        issuer: claims.iss,
    })))
}

pub async fn register(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    Json(req): Json<NewUser>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&tenant).await?;
    let user = state.users.create_user(&mut conn, &req).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(user))))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    state
        .users
        .change_password(&mut conn, auth.user_id, &req.old_password, &req.new_password)
        .await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "message": "Password changed successfully"
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permissions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
    /// Case-insensitive substring filter on the group name.
    pub q: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl GroupQuery {
    fn page(&self) -> Page {
        Page::new(
            self.page.unwrap_or(1),
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

pub async fn list_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<GroupQuery>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    let permissions = state.store.list_permissions(&mut conn, query.page()).await?;
    Ok(Json(ApiResponse::success(permissions)))
}

pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<NameRequest>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    let permission = state.store.create_permission(&mut conn, &req.name).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(permission))))
}

pub async fn delete_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    state.store.delete_permission(&mut conn, PermissionId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Groups
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_groups(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<GroupQuery>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    let groups = match query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => state.store.search_groups(&mut conn, q, query.page()).await?,
        None => state.store.list_groups(&mut conn, query.page()).await?,
    };
    Ok(Json(ApiResponse::success(groups)))
}

pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<NameRequest>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    let group = state.store.create_group(&mut conn, &req.name).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(group))))
}

pub async fn delete_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    state.store.delete_group(&mut conn, GroupId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    pub permission_ids: Vec<PermissionId>,
}

pub async fn set_group_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i32>,
    Json(req): Json<SetPermissionsRequest>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    let group = state
        .store
        .set_group_permissions(&mut conn, GroupId(id), &req.permission_ids)
        .await?;
    Ok(Json(ApiResponse::success(group)))
}

pub async fn add_group_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, pid)): Path<(i32, i32)>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    state
        .store
        .add_permission_to_group(&mut conn, GroupId(id), PermissionId(pid))
        .await?;
    let group = state.store.get_group(&mut conn, GroupId(id)).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(group))))
}

pub async fn remove_group_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, pid)): Path<(i32, i32)>,
) -> Result<impl IntoResponse, StratumError> {
    let mut conn = state.router.connection_for(&auth.tenant).await?;
    state
        .store
        .remove_permission_from_group(&mut conn, GroupId(id), PermissionId(pid))
        .await?;
    let group = state.store.get_group(&mut conn, GroupId(id)).await?;
    Ok(Json(ApiResponse::success(group)))
}
