#![allow(clippy::result_large_err)]
//! # Stratum Core
//!
//! Multi-tenant backend plumbing on PostgreSQL.
//!
//! ## Architecture
//!
//! - **Tenant Schema Router**: one schema per tenant, provisioned on demand,
//!   connections scoped to it through `search_path`
//! - **Permission Store**: permissions, groups and the group/permission
//!   relation, with the `admin` group always holding every system permission
//! - **Token Service**: HS256 access and refresh tokens carrying user and
//!   tenant identity
//! - **Authorization**: "does user X have permission Y", exposed to handlers
//!   as Axum middleware
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod rbac;
pub mod telemetry;
pub mod tenancy;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, StratumError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{AuthContext, IdentityClaims, TokenKind, TokenPair, TokenService};
    pub use crate::config::Config;
    pub use crate::db::{
        Database, SchemaCreator, SchemaRegistry, TenantConnection, TenantDirectory, TenantId,
        TenantName, TenantRouter,
    };
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, StratumError};
    pub use crate::rbac::{
        AuthorizationService, Group, GroupId, Page, Permission, PermissionId, PermissionStore,
        ProtectedGroups, User, UserDirectory, UserId, UserStatus,
    };
    pub use crate::tenancy::{CurrentTenant, TenantBootstrapper};
}
