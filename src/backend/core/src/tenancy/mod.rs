//! Tenant lifecycle: setup/bootstrap and host-based tenant resolution.

pub mod bootstrap;
pub mod middleware;

pub use bootstrap::{InitReport, TenantBootstrapper, TenantFailure, TenantSetup, TENANT_SCHEMA_CREATORS};
pub use middleware::{resolve_tenant, CurrentTenant, TenantLayer, TenantService};
