//! System permissions and the protected-group policy.
//!
//! A protected group must always hold a fixed set of permissions. The
//! permissions any protected group requires cannot be deleted or renamed,
//! and cannot be removed from that group.

use std::collections::{BTreeMap, BTreeSet};

/// The permissions every tenant is seeded with.
pub const SYSTEM_PERMISSIONS: [&str; 12] = [
    "user_view",
    "user_create",
    "user_update",
    "user_delete",
    "group_view",
    "group_create",
    "group_update",
    "group_delete",
    "permission_view",
    "permission_create",
    "permission_update",
    "permission_delete",
];

/// The group that always holds every system permission.
pub const ADMIN_GROUP: &str = "admin";

/// Whether `name` is one of [`SYSTEM_PERMISSIONS`].
pub fn is_system_permission(name: &str) -> bool {
    SYSTEM_PERMISSIONS.contains(&name)
}

/// Which groups are protected, and the permission names each must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedGroups {
    rules: BTreeMap<String, BTreeSet<String>>,
}

impl ProtectedGroups {
    /// A policy protecting nothing.
    pub fn none() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// `admin` must hold every system permission.
    pub fn system() -> Self {
        Self::none().protect(ADMIN_GROUP, SYSTEM_PERMISSIONS)
    }

    /// Add (or extend) a protected group.
    pub fn protect<I, S>(mut self, group: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .entry(group.into())
            .or_default()
            .extend(required.into_iter().map(Into::into));
        self
    }

    pub fn is_protected(&self, group: &str) -> bool {
        self.rules.contains_key(group)
    }

    /// Permission names `group` must hold; empty for unprotected groups.
    pub fn required_for(&self, group: &str) -> Vec<&str> {
        self.rules
            .get(group)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether removing `permission` from `group` would break the policy.
    pub fn requires(&self, group: &str, permission: &str) -> bool {
        self.rules
            .get(group)
            .is_some_and(|names| names.contains(permission))
    }

    /// Whether any protected group requires `permission`.
    pub fn is_protected_permission(&self, permission: &str) -> bool {
        self.rules.values().any(|names| names.contains(permission))
    }

    /// Names of the protected groups.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

impl Default for ProtectedGroups {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_permission_list() {
        assert_eq!(SYSTEM_PERMISSIONS.len(), 12);
        let unique: BTreeSet<_> = SYSTEM_PERMISSIONS.iter().collect();
        assert_eq!(unique.len(), 12);
        assert!(is_system_permission("group_update"));
        assert!(!is_system_permission("report_view"));
    }

    #[test]
    fn test_default_policy_protects_admin() {
        let policy = ProtectedGroups::default();
        assert!(policy.is_protected(ADMIN_GROUP));
        assert!(!policy.is_protected("editors"));
        assert_eq!(policy.required_for(ADMIN_GROUP).len(), 12);
        assert!(policy.required_for("editors").is_empty());
    }

    #[test]
    fn test_requires_only_listed_permissions() {
        let policy = ProtectedGroups::system();
        for name in SYSTEM_PERMISSIONS {
            assert!(policy.requires(ADMIN_GROUP, name));
            assert!(policy.is_protected_permission(name));
        }
        assert!(!policy.requires(ADMIN_GROUP, "report_view"));
        assert!(!policy.requires("editors", "user_view"));
    }

    #[test]
    fn test_additional_protected_group() {
        let policy = ProtectedGroups::system().protect("auditors", ["audit_view"]);
        assert!(policy.is_protected("auditors"));
        assert!(policy.is_protected_permission("audit_view"));
        assert_eq!(policy.groups().collect::<Vec<_>>(), vec!["admin", "auditors"]);
    }
}
