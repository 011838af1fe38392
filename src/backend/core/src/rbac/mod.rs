//! Group-based access control inside a tenant schema.
//!
//! This module provides:
//! - **Models**: permissions, groups, users and their identifiers
//! - **System permissions**: the twelve built-in permissions and the
//!   [`ProtectedGroups`] policy that keeps `admin` holding all of them
//! - **Permission store**: CRUD over permissions, groups and the
//!   group/permission relation, with invariant enforcement
//! - **User directory**: minimal account management and group membership
//! - **Authorization**: "does user X have permission Y" across the router
//! - **Middleware**: Axum layer requiring a set of permissions per route
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_core::rbac::{PermissionStore, ProtectedGroups};
//!
//! let store = PermissionStore::new(ProtectedGroups::system());
//! let mut conn = router.connection_for(&tenant).await?;
//! let group = store.create_group(&mut conn, "editors").await?;
//! store.add_permission_to_group(&mut conn, group.id, permission.id).await?;
//! ```

pub mod authz;
pub mod middleware;
pub mod models;
pub mod store;
pub mod system;
pub mod users;

pub use authz::{AuthorizationService, PermissionChecker};
pub use middleware::{RbacContext, RequirePermissionLayer, RequirePermissionService};
pub use models::{
    Group, GroupId, Page, Permission, PermissionId, PermissionRef, User, UserId, UserStatus,
};
pub use store::PermissionStore;
pub use system::{is_system_permission, ProtectedGroups, ADMIN_GROUP, SYSTEM_PERMISSIONS};
pub use users::{NewUser, UserDirectory};
