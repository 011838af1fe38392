//! Prometheus metrics for authentication, tokens, permission checks and
//! tenant provisioning.
//!
//! ```rust,no_run
//! use stratum_core::telemetry::metrics::{AuthMetrics, PermissionCheckMetrics};
//!
//! AuthMetrics::failure("expired");
//! PermissionCheckMetrics::record(true);
//! ```

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Global labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Handle used by the `/metrics` endpoint to render the Prometheus text format.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry that renders nothing (metrics disabled).
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and describe the crate's metrics.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("stratum_errors_total", "Errors constructed, by code and category");
    describe_counter!(
        "stratum_auth_failures_total",
        "Rejected authentication attempts, by reason"
    );
    describe_counter!("stratum_tokens_issued_total", "Tokens minted, by kind");
    describe_counter!(
        "stratum_permission_checks_total",
        "Permission checks, by result"
    );
    describe_counter!(
        "stratum_tenant_provisions_total",
        "Tenant provisioning runs, by result"
    );
}

/// Authentication failure counter.
pub struct AuthMetrics;

impl AuthMetrics {
    /// Count a rejected credential or token.
    pub fn failure(reason: &'static str) {
        counter!("stratum_auth_failures_total", "reason" => reason).increment(1);
    }
}

/// Token issuance counter.
pub struct TokenMetrics;

impl TokenMetrics {
    pub fn issued(kind: &'static str) {
        counter!("stratum_tokens_issued_total", "kind" => kind).increment(1);
    }
}

/// Permission check counter.
pub struct PermissionCheckMetrics;

impl PermissionCheckMetrics {
    pub fn record(allowed: bool) {
        let result = if allowed { "allowed" } else { "denied" };
        counter!("stratum_permission_checks_total", "result" => result).increment(1);
    }
}

/// Tenant provisioning counter.
pub struct ProvisionMetrics;

impl ProvisionMetrics {
    pub fn record(success: bool) {
        let result = if success { "success" } else { "failure" };
        counter!("stratum_tenant_provisions_total", "result" => result).increment(1);
    }
}
