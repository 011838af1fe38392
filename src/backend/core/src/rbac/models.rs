//! RBAC data models: permissions, groups, users and their identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StratumError};

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, sqlx::Type,
        )]
        #[sqlx(transparent)]
        #[serde(transparent)]
        pub struct $name(pub i32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i32> for $name {
            fn from(id: i32) -> Self {
                Self(id)
            }
        }
    };
}

int_id!(
    /// Tenant-local user identifier.
    UserId
);
int_id!(
    /// Tenant-local group identifier.
    GroupId
);
int_id!(
    /// Tenant-local permission identifier.
    PermissionId
);

/// A permission addressed by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionRef {
    Id(PermissionId),
    Name(String),
}

impl From<PermissionId> for PermissionRef {
    fn from(id: PermissionId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for PermissionRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for PermissionRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for PermissionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════════

/// A named capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A named set of permissions that users are members of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub permission_ids: Vec<PermissionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account status. Users are never hard-deleted, only transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
        }
    }

    pub fn can_login(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            other => Err(StratumError::invalid_argument(format!(
                "unknown user status: {}",
                other
            ))),
        }
    }
}

/// A tenant-local user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub status: UserStatus,
    pub group_ids: Vec<GroupId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pagination
// ═══════════════════════════════════════════════════════════════════════════════

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Upper bound on rows per page.
pub const MAX_PAGE_SIZE: i64 = 100;

/// 1-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    /// Normalize raw parameters: a page below 1 becomes 1, a size below 1
    /// becomes the default, and sizes are capped at [`MAX_PAGE_SIZE`].
    pub fn new(page: i64, page_size: i64) -> Self {
        let page = page.max(1);
        let page_size = if page_size < 1 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        Self { page, page_size }
    }

    pub fn limit(&self) -> i64 {
        self.page_size
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_normalization() {
        assert_eq!(Page::new(0, 0), Page { page: 1, page_size: 20 });
        assert_eq!(Page::new(-3, -1), Page { page: 1, page_size: 20 });
        assert_eq!(Page::new(3, 10).offset(), 20);
        assert_eq!(Page::new(1, 1000).limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_user_status_round_trip() {
        for status in [UserStatus::Active, UserStatus::Inactive, UserStatus::Suspended] {
            assert_eq!(status.as_str().parse::<UserStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<UserStatus>().is_err());
        assert!(UserStatus::Active.can_login());
        assert!(!UserStatus::Suspended.can_login());
    }

    #[test]
    fn test_password_hash_is_not_serialized() {
        let user = User {
            id: UserId(1),
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: "$argon2id$secret".into(),
            first_name: String::new(),
            last_name: String::new(),
            status: UserStatus::Active,
            group_ids: vec![GroupId(1)],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2"));
        assert!(json.contains("\"status\":\"active\""));
    }

    #[test]
    fn test_permission_ref_conversions() {
        assert_eq!(PermissionRef::from(PermissionId(3)), PermissionRef::Id(PermissionId(3)));
        assert_eq!(PermissionRef::from("user_view").to_string(), "user_view");
    }
}
