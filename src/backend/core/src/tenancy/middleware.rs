//! Tenant resolution from the request host.
//!
//! `acme.example.com` with base domain `example.com` resolves to tenant
//! `acme`; the bare base domain resolves to `public`. Hosts outside the base
//! domain and subdomains that are not valid tenant identifiers are rejected
//! with 400 before any other middleware runs.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{header::HOST, request::Parts},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::debug;

use crate::db::TenantName;
use crate::error::{Result, StratumError};

/// The tenant a request was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTenant(pub TenantName);

impl CurrentTenant {
    pub fn name(&self) -> &TenantName {
        &self.0
    }
}

/// Map a `Host` value onto a tenant under `base_domain`.
pub fn resolve_tenant(host: &str, base_domain: &str) -> Result<TenantName> {
    let host = host
        .split(':')
        .next()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let base = base_domain.trim_end_matches('.').to_ascii_lowercase();

    if host == base {
        return Ok(TenantName::public());
    }

    match host.strip_suffix(&base).and_then(|rest| rest.strip_suffix('.')) {
        Some(subdomain) if !subdomain.is_empty() => TenantName::parse(subdomain),
        _ => Err(StratumError::invalid_argument(format!(
            "host {} is not served under {}",
            host, base
        ))),
    }
}

fn request_host(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves the tenant for every request and stores it as [`CurrentTenant`].
#[derive(Clone)]
pub struct TenantLayer {
    base_domain: Arc<str>,
}

impl TenantLayer {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: Arc::from(base_domain.into()),
        }
    }
}

impl<S> Layer<S> for TenantLayer {
    type Service = TenantService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantService {
            inner,
            base_domain: self.base_domain.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TenantService<S> {
    inner: S,
    base_domain: Arc<str>,
}

impl<S> Service<Request<Body>> for TenantService<S>
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
        let resolved = match request_host(&request) {
            Some(host) => resolve_tenant(host, &self.base_domain),
            None => Err(StratumError::invalid_argument("request has no host")),
        };
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match resolved {
                Ok(tenant) => {
                    debug!(tenant = %tenant, "Tenant resolved");
                    request.extensions_mut().insert(CurrentTenant(tenant));
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
impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = StratumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentTenant>()
            .cloned()
            .ok_or_else(|| StratumError::internal("tenant layer is not installed"))
    }
}
