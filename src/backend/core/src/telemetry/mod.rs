//! Telemetry: structured logging and Prometheus metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    init_metrics, AuthMetrics, MetricsConfig, MetricsRegistry, PermissionCheckMetrics,
    ProvisionMetrics, TokenMetrics,
};
